//! Parameter automation
//!
//! A [`Param`] is a timeline of value events referenced to audio-context time
//! (seconds of rendered audio). Control code schedules ramps on it and the
//! renderer reads `value_at` once per sample, so a ramp runs to completion
//! without any further involvement of the code that issued it.

use serde::{Deserialize, Serialize};

/// Ramp time for continuous parameter changes (seconds)
pub const PARAM_RAMP_SECS: f64 = 0.05;

/// Documented range of a numeric parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
}

impl ParamRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Clamp a value into range. NaN maps to `min`.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            self.min
        } else {
            value.clamp(self.min, self.max)
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParamEvent {
    Set { time: f64, value: f64 },
    Linear { time: f64, value: f64 },
    Exponential { time: f64, value: f64 },
}

impl ParamEvent {
    fn time(&self) -> f64 {
        match *self {
            ParamEvent::Set { time, .. }
            | ParamEvent::Linear { time, .. }
            | ParamEvent::Exponential { time, .. } => time,
        }
    }

    fn value(&self) -> f64 {
        match *self {
            ParamEvent::Set { value, .. }
            | ParamEvent::Linear { value, .. }
            | ParamEvent::Exponential { value, .. } => value,
        }
    }
}

/// An automatable parameter value
#[derive(Debug, Clone)]
pub struct Param {
    base_value: f64,
    base_time: f64,
    events: Vec<ParamEvent>,
}

impl Param {
    pub fn new(value: f64) -> Self {
        Self {
            base_value: value,
            base_time: 0.0,
            events: Vec::new(),
        }
    }

    /// Jump to `value` at `time`
    pub fn set_value_at(&mut self, value: f64, time: f64) {
        self.insert(ParamEvent::Set { time, value });
    }

    /// Ramp linearly from the previous event to `value`, arriving at `end_time`
    pub fn linear_ramp_to(&mut self, value: f64, end_time: f64) {
        self.insert(ParamEvent::Linear {
            time: end_time,
            value,
        });
    }

    /// Ramp exponentially from the previous event to `value`, arriving at `end_time`
    ///
    /// Falls back to a linear segment when either end is zero or the ends
    /// differ in sign.
    pub fn exponential_ramp_to(&mut self, value: f64, end_time: f64) {
        self.insert(ParamEvent::Exponential {
            time: end_time,
            value,
        });
    }

    /// Drop every event scheduled at or after `from`
    pub fn cancel(&mut self, from: f64) {
        self.events.retain(|event| event.time() < from);
    }

    /// Smoothly move from the current value to `target` over `duration` seconds
    ///
    /// Any automation still pending after `now` is replaced. The current value
    /// is pinned at `now` first, so the new segment starts where the signal
    /// actually is.
    pub fn ramp_to(&mut self, target: f64, duration: f64, now: f64) {
        let current = self.value_at(now);
        self.cancel(now);
        self.set_value_at(current, now);
        if duration > 0.0 {
            self.linear_ramp_to(target, now + duration);
        } else {
            self.set_value_at(target, now);
        }
    }

    /// Replace pending automation and jump to `value` at `now`
    pub fn set_immediate(&mut self, value: f64, now: f64) {
        self.cancel(now);
        self.set_value_at(value, now);
    }

    /// Value of the parameter at audio time `time`
    pub fn value_at(&self, time: f64) -> f64 {
        let mut prev_value = self.base_value;
        let mut prev_time = self.base_time;

        for event in &self.events {
            let (event_time, value) = (event.time(), event.value());
            if event_time <= time {
                prev_value = value;
                prev_time = event_time;
                continue;
            }

            let span = event_time - prev_time;
            if span <= 0.0 {
                return prev_value;
            }
            let progress = ((time - prev_time) / span).clamp(0.0, 1.0);

            return match event {
                ParamEvent::Set { .. } => prev_value,
                ParamEvent::Linear { .. } => prev_value + (value - prev_value) * progress,
                ParamEvent::Exponential { .. } => {
                    if prev_value * value > 0.0 {
                        prev_value * (value / prev_value).powf(progress)
                    } else {
                        prev_value + (value - prev_value) * progress
                    }
                }
            };
        }

        prev_value
    }

    /// Value the parameter settles at once all automation has run
    pub fn final_value(&self) -> f64 {
        self.events
            .last()
            .map(ParamEvent::value)
            .unwrap_or(self.base_value)
    }

    /// Whether any automation is still pending after `time`
    pub fn is_automating(&self, time: f64) -> bool {
        self.events.iter().any(|event| event.time() > time)
    }

    /// Fold events that lie entirely in the past into the base value
    pub fn prune(&mut self, time: f64) {
        let elapsed = self.events.partition_point(|event| event.time() <= time);
        if elapsed == 0 {
            return;
        }
        let last = self.events[elapsed - 1];
        self.base_value = last.value();
        self.base_time = last.time();
        self.events.drain(..elapsed);
    }

    fn insert(&mut self, event: ParamEvent) {
        let index = self
            .events
            .partition_point(|existing| existing.time() <= event.time());
        self.events.insert(index, event);
    }
}
