//! Transport state machine
//!
//! Pure tick arithmetic with no threads and no clock of its own: the caller
//! passes the current time in. Tick `n` is due at
//!
//! ```text
//! anchor_time + (n - anchor_tick) * interval,   interval = 60 / bpm / 4
//! ```
//!
//! Deadlines are recomputed from the anchor every time rather than by adding
//! up intervals, so lateness in delivering one tick never shifts the next.
//! A tempo change re-anchors at the next tick: one new interval after the
//! last delivered tick, or `now` if that moment has already passed.

use crate::node::{BPM_RANGE, DEFAULT_BPM, STEP_COUNT};
use crate::param::Param;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ticks per quarter note (one tick per sixteenth)
pub const TICKS_PER_BEAT: u32 = 4;
/// Time the displayed tempo takes to follow a change while playing (seconds)
pub const BPM_RAMP_SECS: f64 = 0.1;
/// Lateness after which the transport re-anchors instead of catching up
pub const MAX_LAG: Duration = Duration::from_secs(1);

const DEADLINE_TOLERANCE_SECS: f64 = 1e-9;

/// Seconds between ticks at `bpm`
pub fn tick_interval_secs(bpm: f64) -> f64 {
    60.0 / bpm / TICKS_PER_BEAT as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Stopped,
    Playing,
}

/// A tick that came due
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// Tick counter since start
    pub position: u64,
    /// `position mod 16`
    pub step: usize,
    /// When the tick was due, on the transport clock
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct Transport {
    bpm: f64,
    tempo: Param,
    state: TransportState,
    position: u64,
    anchor_secs: f64,
    anchor_tick: u64,
    interval_secs: f64,
    last_deadline_secs: f64,
}

impl Transport {
    pub fn new() -> Self {
        Self::with_bpm(DEFAULT_BPM)
    }

    pub fn with_bpm(bpm: f64) -> Self {
        let bpm = BPM_RANGE.clamp(bpm);
        Self {
            bpm,
            tempo: Param::new(bpm),
            state: TransportState::Stopped,
            position: 0,
            anchor_secs: 0.0,
            anchor_tick: 0,
            interval_secs: tick_interval_secs(bpm),
            last_deadline_secs: 0.0,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }

    /// Ticks delivered since start; 0 while stopped
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Tempo used for tick arithmetic
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Tempo as heard, following changes over [`BPM_RAMP_SECS`] while playing
    pub fn displayed_bpm(&self, now: Duration) -> f64 {
        self.tempo.value_at(now.as_secs_f64())
    }

    /// Interval the next tick will be scheduled with
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    /// Stopped -> Playing. Tick 0 is due at `now`. Returns false if already playing.
    pub fn start(&mut self, now: Duration) -> bool {
        if self.is_playing() {
            return false;
        }
        self.state = TransportState::Playing;
        self.position = 0;
        self.anchor_secs = now.as_secs_f64();
        self.anchor_tick = 0;
        self.last_deadline_secs = self.anchor_secs;
        true
    }

    /// Playing -> Stopped, resetting the position. Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        let was_playing = self.is_playing();
        self.state = TransportState::Stopped;
        self.position = 0;
        self.anchor_tick = 0;
        was_playing
    }

    /// Change tempo; the next undelivered tick uses the new interval
    ///
    /// Returns the tempo actually applied after clamping.
    pub fn set_bpm(&mut self, bpm: f64, now: Duration) -> f64 {
        let bpm = BPM_RANGE.clamp(bpm);
        let now_secs = now.as_secs_f64();
        let interval_secs = tick_interval_secs(bpm);

        // Tick 0 stays anchored at the start instant
        if bpm != self.bpm && self.is_playing() && self.position > 0 {
            self.anchor_secs = (self.last_deadline_secs + interval_secs).max(now_secs);
            self.anchor_tick = self.position;
        }

        self.bpm = bpm;
        self.interval_secs = interval_secs;

        if self.is_playing() {
            self.tempo.ramp_to(bpm, BPM_RAMP_SECS, now_secs);
        } else {
            self.tempo.set_immediate(bpm, now_secs);
        }
        self.tempo.prune(now_secs);
        bpm
    }

    /// When the next tick is due, if playing
    pub fn next_deadline(&self) -> Option<Duration> {
        self.is_playing()
            .then(|| Duration::from_secs_f64(self.deadline_secs(self.position).max(0.0)))
    }

    /// Deliver the next tick if it is due at `now`
    ///
    /// Call repeatedly until it returns `None` to drain every due tick.
    pub fn poll(&mut self, now: Duration) -> Option<Tick> {
        if !self.is_playing() {
            return None;
        }

        let now_secs = now.as_secs_f64();
        let mut deadline = self.deadline_secs(self.position);
        if now_secs + DEADLINE_TOLERANCE_SECS < deadline {
            return None;
        }

        if now_secs - deadline > MAX_LAG.as_secs_f64() {
            tracing::warn!(
                lag_secs = now_secs - deadline,
                position = self.position,
                "transport fell behind, re-anchoring"
            );
            self.anchor_secs = now_secs;
            self.anchor_tick = self.position;
            deadline = now_secs;
        }
        self.last_deadline_secs = deadline;

        let tick = Tick {
            position: self.position,
            step: (self.position % STEP_COUNT as u64) as usize,
            deadline: Duration::from_secs_f64(deadline.max(0.0)),
        };
        self.position += 1;
        Some(tick)
    }

    fn deadline_secs(&self, tick: u64) -> f64 {
        self.anchor_secs + tick.saturating_sub(self.anchor_tick) as f64 * self.interval_secs
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_tick_interval_is_a_sixteenth() {
        assert_relative_eq!(tick_interval_secs(120.0), 0.125);
        assert_relative_eq!(tick_interval_secs(60.0), 0.25);
        assert_eq!(Transport::new().tick_interval(), ms(125));
    }

    #[test]
    fn test_stopped_transport_never_ticks() {
        let mut transport = Transport::new();
        assert_eq!(transport.next_deadline(), None);
        assert_eq!(transport.poll(ms(10_000)), None);
    }

    #[test]
    fn test_first_tick_due_at_start() {
        let mut transport = Transport::new();
        assert!(transport.start(ms(500)));
        assert!(!transport.start(ms(600)));
        assert_eq!(transport.next_deadline(), Some(ms(500)));

        let tick = transport.poll(ms(500)).unwrap();
        assert_eq!(tick.position, 0);
        assert_eq!(tick.step, 0);
        assert_eq!(transport.poll(ms(500)), None);
    }

    #[test]
    fn test_sixteen_ticks_visit_every_step() {
        let mut transport = Transport::new();
        transport.start(Duration::ZERO);

        let mut steps = Vec::new();
        let mut now = Duration::ZERO;
        for _ in 0..16 {
            let tick = transport.poll(now).unwrap();
            steps.push(tick.step);
            now += ms(125);
        }

        assert_eq!(steps, (0..16).collect::<Vec<_>>());
        assert_eq!(transport.position() % 16, 0);
    }

    #[test]
    fn test_late_polls_do_not_drift() {
        let mut transport = Transport::new();
        transport.start(Duration::ZERO);

        // Every poll arrives 40ms late; deadlines stay on the grid
        for n in 0..64u64 {
            let now = ms(n * 125 + 40);
            let tick = transport.poll(now).unwrap();
            assert_eq!(tick.deadline, ms(n * 125));
            assert_eq!(transport.poll(now), None);
        }
    }

    #[test]
    fn test_catches_up_missed_ticks() {
        let mut transport = Transport::new();
        transport.start(Duration::ZERO);

        let mut fired = 0;
        while transport.poll(ms(500)).is_some() {
            fired += 1;
        }
        assert_eq!(fired, 5);
    }

    #[test]
    fn test_last_bpm_wins_for_next_tick() {
        let mut transport = Transport::new();
        transport.start(Duration::ZERO);
        transport.poll(Duration::ZERO).unwrap();
        transport.poll(ms(125)).unwrap();

        transport.set_bpm(60.0, ms(130));
        transport.set_bpm(200.0, ms(130));

        assert_eq!(transport.tick_interval(), Duration::from_secs_f64(0.075));
        let next = transport.next_deadline().unwrap();
        assert_relative_eq!(next.as_secs_f64(), 0.125 + 0.075, epsilon = 1e-9);
    }

    #[test]
    fn test_tempo_raise_mid_interval_fires_one_tick() {
        let mut transport = Transport::with_bpm(60.0);
        transport.start(Duration::ZERO);
        transport.poll(Duration::ZERO).unwrap();

        // Three 200 bpm intervals already fit between tick 0 and now
        transport.set_bpm(200.0, ms(240));

        let mut fired = Vec::new();
        while let Some(tick) = transport.poll(ms(240)) {
            fired.push(tick);
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].position, 1);
        assert_relative_eq!(fired[0].deadline.as_secs_f64(), 0.24, epsilon = 1e-9);

        let next = transport.next_deadline().unwrap();
        assert_relative_eq!(next.as_secs_f64(), 0.24 + 0.075, epsilon = 1e-9);
        assert_eq!(transport.poll(ms(300)), None);
    }

    #[test]
    fn test_tempo_change_is_not_retroactive() {
        let mut transport = Transport::new();
        transport.start(Duration::ZERO);
        let mut deadlines = Vec::new();
        for n in 0..4u64 {
            deadlines.push(transport.poll(ms(n * 125)).unwrap().deadline);
        }

        transport.set_bpm(60.0, ms(400));
        let next = transport.poll(ms(375 + 250)).unwrap();

        assert_eq!(deadlines, vec![ms(0), ms(125), ms(250), ms(375)]);
        assert_eq!(next.position, 4);
        assert_eq!(next.deadline, ms(625));
        assert_eq!(transport.poll(ms(700)), None);
    }

    #[test]
    fn test_bpm_before_first_tick_keeps_start_anchor() {
        let mut transport = Transport::new();
        transport.start(ms(100));
        transport.set_bpm(60.0, ms(100));
        assert_eq!(transport.next_deadline(), Some(ms(100)));
    }

    #[test]
    fn test_stop_resets_position() {
        let mut transport = Transport::new();
        transport.start(Duration::ZERO);
        transport.poll(Duration::ZERO);
        transport.poll(ms(125));
        assert_eq!(transport.position(), 2);

        assert!(transport.stop());
        assert!(!transport.stop());
        assert_eq!(transport.position(), 0);
        assert_eq!(transport.state(), TransportState::Stopped);
        assert_eq!(transport.poll(ms(1000)), None);

        transport.start(ms(2000));
        assert_eq!(transport.poll(ms(2000)).unwrap().step, 0);
    }

    #[test]
    fn test_bpm_is_clamped() {
        let mut transport = Transport::new();
        assert_eq!(transport.set_bpm(500.0, Duration::ZERO), 200.0);
        assert_eq!(transport.set_bpm(0.0, Duration::ZERO), 60.0);
    }

    #[test]
    fn test_displayed_tempo_ramps_while_playing() {
        let mut transport = Transport::new();
        transport.set_bpm(100.0, Duration::ZERO);
        assert_relative_eq!(transport.displayed_bpm(Duration::ZERO), 100.0);

        transport.start(ms(1000));
        transport.set_bpm(140.0, ms(1000));
        assert_relative_eq!(transport.displayed_bpm(ms(1050)), 120.0, epsilon = 1e-9);
        assert_relative_eq!(transport.displayed_bpm(ms(1100)), 140.0);
        assert_relative_eq!(transport.bpm(), 140.0);
    }

    #[test]
    fn test_large_lag_reanchors() {
        let mut transport = Transport::new();
        transport.start(Duration::ZERO);
        transport.poll(Duration::ZERO);

        let tick = transport.poll(ms(5000)).unwrap();
        assert_eq!(tick.deadline, ms(5000));
        assert_eq!(transport.poll(ms(5000)), None);
        assert_eq!(transport.next_deadline(), Some(ms(5125)));
    }
}
