//! Processing units
//!
//! The sound-producing object behind each graph node. A unit owns its
//! automatable [`Param`]s and is driven sample by sample by the renderer.
//! The waveform math is deliberately plain; what matters here is that every
//! parameter change arrives as a ramp and that a disposed unit goes silent and
//! drops its buffers.

use crate::node::{NodeParams, ParamChange, Waveform};
use crate::param::{Param, PARAM_RAMP_SECS};
use std::f64::consts::TAU;

/// Envelope attack time (seconds)
pub const ENVELOPE_ATTACK_SECS: f64 = 0.02;
/// Time from trigger until the release reaches its floor (seconds)
pub const ENVELOPE_TOTAL_SECS: f64 = 0.4;
/// Level the release decays to; exponential curves cannot reach zero
pub const ENVELOPE_FLOOR: f64 = 0.0001;
/// Longest delay a delay line can be set to (seconds)
pub const MAX_DELAY_SECS: f64 = 1.0;

/// Phase-accumulating oscillator
#[derive(Debug, Clone)]
pub struct OscillatorUnit {
    frequency: Param,
    waveform: Waveform,
    phase: f64,
    running: bool,
}

impl OscillatorUnit {
    pub fn new(frequency: f64, waveform: Waveform) -> Self {
        Self {
            frequency: Param::new(frequency),
            waveform,
            phase: 0.0,
            running: true,
        }
    }

    pub fn frequency(&self) -> &Param {
        &self.frequency
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    fn process(&mut self, time: f64, sample_rate: f64) -> f64 {
        if !self.running {
            return 0.0;
        }

        let phase = self.phase;
        let sample = match self.waveform {
            Waveform::Sine => (phase * TAU).sin(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * phase - 1.0,
            Waveform::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        };

        let frequency = self.frequency.value_at(time);
        self.phase = (self.phase + frequency / sample_rate).fract();
        sample
    }
}

/// Voltage-controlled amplifier stage
#[derive(Debug, Clone)]
pub struct GainUnit {
    gain: Param,
    running: bool,
}

impl GainUnit {
    pub fn new(level: f64) -> Self {
        Self {
            gain: Param::new(level),
            running: true,
        }
    }

    pub fn gain(&self) -> &Param {
        &self.gain
    }

    /// Attack to `peak`, then decay to silence, starting at `now`
    pub fn trigger(&mut self, peak: f64, now: f64) {
        self.gain.cancel(now);
        self.gain.set_value_at(0.0, now);
        self.gain.linear_ramp_to(peak, now + ENVELOPE_ATTACK_SECS);
        self.gain
            .exponential_ramp_to(ENVELOPE_FLOOR, now + ENVELOPE_TOTAL_SECS);
    }

    fn process(&mut self, input: f64, time: f64) -> f64 {
        if !self.running {
            return 0.0;
        }
        input * self.gain.value_at(time)
    }
}

/// Feedback delay line with a wet-only output
#[derive(Debug, Clone)]
pub struct DelayUnit {
    delay_time: Param,
    feedback: Param,
    buffer: Vec<f64>,
    write_pos: usize,
    sample_rate: f64,
}

impl DelayUnit {
    pub fn new(delay_time: f64, feedback: f64, sample_rate: f64) -> Self {
        let mut unit = Self {
            delay_time: Param::new(delay_time),
            feedback: Param::new(feedback),
            buffer: Vec::new(),
            write_pos: 0,
            sample_rate: 0.0,
        };
        unit.set_sample_rate(sample_rate);
        unit
    }

    pub fn delay_time(&self) -> &Param {
        &self.delay_time
    }

    pub fn feedback(&self) -> &Param {
        &self.feedback
    }

    /// Allocated delay memory in samples
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        if sample_rate == self.sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        let len = (MAX_DELAY_SECS * sample_rate).ceil() as usize + 2;
        self.buffer = vec![0.0; len];
        self.write_pos = 0;
    }

    fn process(&mut self, input: f64, time: f64) -> f64 {
        let len = self.buffer.len();
        if len < 3 {
            return 0.0;
        }

        let delay_samples =
            (self.delay_time.value_at(time) * self.sample_rate).clamp(1.0, (len - 2) as f64);
        let mut read = self.write_pos as f64 - delay_samples;
        if read < 0.0 {
            read += len as f64;
        }

        let index = read.floor() as usize % len;
        let next = (index + 1) % len;
        let frac = read - read.floor();
        let delayed = self.buffer[index] * (1.0 - frac) + self.buffer[next] * frac;

        self.buffer[self.write_pos] = input + delayed * self.feedback.value_at(time);
        self.write_pos = (self.write_pos + 1) % len;
        delayed
    }
}

/// The underlying instance of a node, tagged by kind
#[derive(Debug, Clone)]
pub enum Unit {
    Oscillator(OscillatorUnit),
    Gain(GainUnit),
    Delay(DelayUnit),
    /// Sequencers only emit triggers; they carry no signal
    Sequencer,
    /// Sums its inputs into the device output
    Output,
}

impl Unit {
    /// Build the unit for a node from its current parameters
    pub fn instantiate(params: &NodeParams, sample_rate: f64) -> Self {
        match params {
            NodeParams::Oscillator(p) => {
                Unit::Oscillator(OscillatorUnit::new(p.frequency, p.waveform))
            }
            NodeParams::Gain(p) => Unit::Gain(GainUnit::new(p.effective_level())),
            NodeParams::Delay(p) => {
                Unit::Delay(DelayUnit::new(p.delay_time, p.feedback, sample_rate))
            }
            NodeParams::Sequencer(_) => Unit::Sequencer,
            NodeParams::Output => Unit::Output,
        }
    }

    /// Forward a parameter change; continuous values ramp, discrete ones switch
    pub fn apply_param(&mut self, change: &ParamChange, now: f64) {
        match (self, change) {
            (Unit::Oscillator(osc), ParamChange::Frequency(frequency)) => {
                osc.frequency.ramp_to(*frequency, PARAM_RAMP_SECS, now);
            }
            (Unit::Oscillator(osc), ParamChange::Waveform(waveform)) => {
                osc.waveform = *waveform;
            }
            (Unit::Gain(gain), ParamChange::GainLevel(level)) => {
                gain.gain.ramp_to(*level, PARAM_RAMP_SECS, now);
            }
            (Unit::Delay(delay), ParamChange::DelayTime(delay_time)) => {
                delay.delay_time.ramp_to(*delay_time, PARAM_RAMP_SECS, now);
            }
            (Unit::Delay(delay), ParamChange::Feedback(feedback)) => {
                delay.feedback.ramp_to(*feedback, PARAM_RAMP_SECS, now);
            }
            // Pattern and transport changes have no signal-level effect
            _ => {}
        }
    }

    /// Fire the amplitude envelope. Returns false for units without a gain stage.
    pub fn trigger(&mut self, peak: f64, now: f64) -> bool {
        match self {
            Unit::Gain(gain) => {
                gain.trigger(peak, now);
                true
            }
            _ => false,
        }
    }

    /// Stop the unit and release its memory
    pub fn dispose(&mut self) {
        match self {
            Unit::Oscillator(osc) => {
                osc.running = false;
                osc.frequency.cancel(f64::NEG_INFINITY);
            }
            Unit::Gain(gain) => {
                gain.running = false;
                gain.gain.cancel(f64::NEG_INFINITY);
            }
            Unit::Delay(delay) => {
                delay.buffer = Vec::new();
                delay.write_pos = 0;
            }
            Unit::Sequencer | Unit::Output => {}
        }
    }

    /// Whether signal routed out of this unit is audible downstream
    pub fn carries_audio(&self) -> bool {
        !matches!(self, Unit::Sequencer)
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if let Unit::Delay(delay) = self {
            delay.set_sample_rate(sample_rate);
        }
    }

    /// Compute one output sample from the summed input at audio time `time`
    pub fn process(&mut self, input: f64, time: f64, sample_rate: f64) -> f64 {
        match self {
            Unit::Oscillator(osc) => osc.process(time, sample_rate),
            Unit::Gain(gain) => gain.process(input, time),
            Unit::Delay(delay) => delay.process(input, time),
            Unit::Sequencer => 0.0,
            Unit::Output => input,
        }
    }

    /// Fold elapsed automation so parameter timelines stay short
    pub fn prune(&mut self, time: f64) {
        match self {
            Unit::Oscillator(osc) => osc.frequency.prune(time),
            Unit::Gain(gain) => gain.gain.prune(time),
            Unit::Delay(delay) => {
                delay.delay_time.prune(time);
                delay.feedback.prune(time);
            }
            Unit::Sequencer | Unit::Output => {}
        }
    }
}
