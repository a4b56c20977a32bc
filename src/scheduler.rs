//! Breath-synchronized parameter automation
//!
//! A control-rate driver polled against the audio clock. Continuously it
//! runs one LFO at `1/period` Hz with three taps (delay feedback, wet-bus
//! gain, delay time); discretely it detects breath-cycle boundaries and
//! fires per-cycle events: a periodic wet-bus silence dip and a bounded
//! re-synchronization of the period against the external clock. Events
//! are anchored to the exact boundary timestamp, not the poll time, so a
//! late poll still lands sample-accurate ramps.

use crate::breath::BreathTimeline;
use crate::graph::AudioGraph;
use crate::modulation::{DELAY_MAX, DELAY_MIN, WET_CAP};
use crate::sources::{ClockReader, ClockSource};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, warn};

/// Every Nth breath cycle dips the wet bus toward silence.
pub const SILENCE_EVERY: i64 = 7;

/// Every Nth breath cycle re-syncs the period against the clock source.
pub const RESYNC_EVERY: i64 = 4;

/// Length of the dip-and-recover silence event.
pub const SILENCE_DIP_SECS: f64 = 3.0;

/// How far the dip pulls the wet baseline down (0.9 leaves 10%).
pub const SILENCE_DIP_DEPTH: f64 = 0.9;

/// Baseline delay feedback, breathed around by the LFO.
pub const FEEDBACK_BASE: f64 = 0.35;

/// LFO tap depths. Small by design: the breath subtly moves all three
/// parameters in phase, well inside headroom.
pub const LFO_FEEDBACK_DEPTH: f64 = 0.12;
pub const LFO_WET_DEPTH: f64 = 0.08;
pub const LFO_DELAY_DEPTH: f64 = 0.06;

/// Ramp length for continuous retargets issued by the poll.
const LFO_RAMP_SECS: f32 = 0.08;

/// Ramp length for boundary-anchored events.
const BOUNDARY_RAMP_SECS: f32 = 0.25;

/// Phase error is converted to a period nudge at this many ppm per unit
/// of phase; the timeline clamps and spreads it further.
const PPM_PER_PHASE: f64 = 1.0e4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

pub struct BreathScheduler {
    state: SchedulerState,
    timeline: BreathTimeline,
    last_cycle: i64,
    last_now: f64,
    cycles_seen: u64,
    wet_baseline: f64,
    delay_base: f64,
    dip_start: Option<f64>,
    silence_enabled: bool,
    resync_enabled: bool,
    clock: Option<Arc<dyn ClockSource>>,
    reader: ClockReader,
    last_clock: f64,
}

impl BreathScheduler {
    pub fn new(silence_enabled: bool, resync_enabled: bool) -> Self {
        Self {
            state: SchedulerState::Idle,
            timeline: BreathTimeline::new(0.0),
            last_cycle: 0,
            last_now: 0.0,
            cycles_seen: 0,
            wet_baseline: 0.2,
            delay_base: 0.3,
            dip_start: None,
            silence_enabled,
            resync_enabled,
            clock: None,
            reader: ClockReader::new(),
            last_clock: 0.0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn timeline(&self) -> &BreathTimeline {
        &self.timeline
    }

    pub fn cycles_seen(&self) -> u64 {
        self.cycles_seen
    }

    pub fn last_clock(&self) -> f64 {
        self.last_clock
    }

    pub fn set_clock(&mut self, clock: Arc<dyn ClockSource>) {
        self.clock = Some(clock);
    }

    pub fn set_wet_baseline(&mut self, wet: f64) {
        self.wet_baseline = wet;
    }

    pub fn set_delay_base(&mut self, delay_secs: f64) {
        self.delay_base = delay_secs.clamp(DELAY_MIN, DELAY_MAX);
    }

    /// Anchor the breath epoch and start automating. The first boundary
    /// event fires one full period after `anchor`.
    pub fn start(&mut self, anchor: f64, wet_baseline: f64, delay_base: f64, clock_value: f64) {
        self.timeline = BreathTimeline::new(anchor);
        self.last_cycle = 0;
        self.last_now = anchor;
        self.cycles_seen = 0;
        self.wet_baseline = wet_baseline;
        self.delay_base = delay_base.clamp(DELAY_MIN, DELAY_MAX);
        self.dip_start = None;
        self.last_clock = clock_value;
        self.state = SchedulerState::Running;
    }

    /// Cancel the poll synchronously. No further retargets are issued.
    pub fn stop(&mut self) {
        self.state = SchedulerState::Idle;
        self.dip_start = None;
        self.reader.abort();
    }

    /// One poll tick at audio-clock time `now`. Only meaningful while
    /// Running; a stopped scheduler ignores the call.
    pub fn advance(&mut self, now: f64, graph: &mut AudioGraph) {
        if self.state != SchedulerState::Running {
            return;
        }
        let dt = (now - self.last_now).max(0.0);
        self.last_now = now;
        self.timeline.advance(now, dt);

        // Discrete events: handle every boundary crossed since the last
        // poll, each anchored at its own boundary timestamp.
        let index = self.timeline.cycle_index(now);
        while self.last_cycle < index {
            self.last_cycle += 1;
            let boundary = self.timeline.boundary_time(self.last_cycle);
            let elapsed = (now - boundary).max(0.0);
            self.on_boundary(self.last_cycle, boundary, elapsed, graph);
        }

        // A re-sync reading requested on an earlier tick may have landed.
        if let Some(result) = self.reader.poll() {
            match result {
                Ok(value) => self.apply_clock_value(value),
                Err(e) => warn!("clock re-sync failed, period unchanged: {}", e),
            }
        }

        // Continuous automation: one LFO, three taps. The wet tap may not
        // breathe above the ceiling the headroom budget is built on.
        let lfo = (2.0 * PI * self.timeline.phase(now)).sin();
        let feedback = FEEDBACK_BASE * (1.0 + LFO_FEEDBACK_DEPTH * lfo);
        graph.set_feedback_target(feedback as f32, LFO_RAMP_SECS, 0.0);

        let wet = (self.wet_baseline * (1.0 + LFO_WET_DEPTH * lfo) * self.dip_factor(now))
            .min(WET_CAP);
        graph.set_mix_target(wet as f32, LFO_RAMP_SECS, 0.0);

        let delay = (self.delay_base * (1.0 + LFO_DELAY_DEPTH * lfo)).clamp(DELAY_MIN, DELAY_MAX);
        graph.set_delay_time_target(delay as f32, LFO_RAMP_SECS, 0.0);
    }

    fn on_boundary(&mut self, cycle: i64, boundary: f64, elapsed: f64, graph: &mut AudioGraph) {
        self.cycles_seen += 1;
        debug!("breath boundary {} at {:.3}s", cycle, boundary);

        if self.silence_enabled && cycle % SILENCE_EVERY == 0 {
            self.dip_start = Some(boundary);
            // Anchor the dip's opening ramp at the boundary itself.
            let wet = self.wet_baseline * self.dip_factor(boundary + elapsed);
            graph.set_mix_target(wet as f32, BOUNDARY_RAMP_SECS, elapsed as f32);
        }

        if self.resync_enabled && cycle % RESYNC_EVERY == 0 {
            self.resync();
        }
    }

    /// Kick off a background clock read. The poll stays non-blocking: a
    /// stalled clock collaborator delays the correction, never the tick.
    fn resync(&mut self) {
        let Some(clock) = self.clock.clone() else {
            return;
        };
        self.reader.request(clock);
    }

    /// Best-effort period correction from a landed clock reading.
    fn apply_clock_value(&mut self, value: f64) {
        self.last_clock = value;
        let period = self.timeline.period();
        let expected = (value / period).rem_euclid(1.0);
        let actual = self.timeline.phase(self.last_now);
        let mut err = expected - actual;
        if err > 0.5 {
            err -= 1.0;
        } else if err < -0.5 {
            err += 1.0;
        }
        self.timeline.apply_correction(err * PPM_PER_PHASE);
    }

    /// Wet-bus multiplier for the periodic silence event: a raised-cosine
    /// dip-and-recover over `SILENCE_DIP_SECS`, 1.0 outside it.
    fn dip_factor(&self, now: f64) -> f64 {
        match self.dip_start {
            Some(start) if now >= start && now < start + SILENCE_DIP_SECS => {
                let x = (now - start) / SILENCE_DIP_SECS;
                1.0 - SILENCE_DIP_DEPTH * (PI * x).sin().powi(2)
            }
            _ => 1.0,
        }
    }
}
