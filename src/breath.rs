//! Breath timeline: anchor + period, with bounded ramped corrections
//!
//! Everything periodic in the engine derives from `phase(t)`, where `t`
//! is audio-clock time in seconds. Period corrections are parts-per-million
//! small and ramped, never stepped, so nothing derived from the timeline
//! jumps audibly.

/// Nominal breath cycle length in seconds.
pub const BREATH_PERIOD: f64 = 9.0;

/// Largest single correction accepted, in parts per million of the period.
pub const MAX_CORRECTION_PPM: f64 = 500.0;

/// Corrections are divided by this factor before being applied, so one
/// re-sync never absorbs the whole measured error in one step.
pub const CORRECTION_SPREAD: f64 = 8.0;

/// A correction ramps in over at most this many seconds.
pub const CORRECTION_RAMP_SECS: f64 = 1.0;

/// Anchor timestamp plus period length on the audio clock.
#[derive(Debug, Clone)]
pub struct BreathTimeline {
    anchor: f64,
    period: f64,
    target_period: f64,
}

impl BreathTimeline {
    /// Anchor the timeline so that `phase(anchor) == 0`.
    pub fn new(anchor: f64) -> Self {
        Self::with_period(anchor, BREATH_PERIOD)
    }

    pub fn with_period(anchor: f64, period: f64) -> Self {
        let period = period.max(1e-3);
        Self {
            anchor,
            period,
            target_period: period,
        }
    }

    pub fn anchor(&self) -> f64 {
        self.anchor
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    /// Breath phase in [0, 1).
    pub fn phase(&self, t: f64) -> f64 {
        ((t - self.anchor) / self.period).rem_euclid(1.0)
    }

    /// Index of the breath cycle containing `t`. Negative before the anchor.
    pub fn cycle_index(&self, t: f64) -> i64 {
        ((t - self.anchor) / self.period).floor() as i64
    }

    /// Audio-clock time of the start of cycle `index`.
    pub fn boundary_time(&self, index: i64) -> f64 {
        self.anchor + index as f64 * self.period
    }

    /// Request a period nudge of `ppm` parts per million. The request is
    /// clamped to `MAX_CORRECTION_PPM`, divided by `CORRECTION_SPREAD`,
    /// and then ramped in by subsequent `advance` calls.
    pub fn apply_correction(&mut self, ppm: f64) {
        if !ppm.is_finite() {
            return;
        }
        let ppm = ppm.clamp(-MAX_CORRECTION_PPM, MAX_CORRECTION_PPM) / CORRECTION_SPREAD;
        self.target_period = self.period * (1.0 + ppm * 1e-6);
    }

    /// Move the period toward its target, re-anchoring so the elapsed
    /// cycle count (and therefore the phase) at `now` is unchanged by the
    /// period adjustment.
    pub fn advance(&mut self, now: f64, dt: f64) {
        if self.period == self.target_period || dt <= 0.0 {
            return;
        }
        let span = self.target_period - self.period;
        // Full correction spreads over CORRECTION_RAMP_SECS of advance time.
        let step = span.abs() * (dt / CORRECTION_RAMP_SECS).min(1.0);
        let cycles = (now - self.anchor) / self.period;
        if span.abs() <= step {
            self.period = self.target_period;
        } else {
            self.period += step.copysign(span);
        }
        self.anchor = now - cycles * self.period;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_at_anchor_is_zero() {
        let tl = BreathTimeline::new(12.5);
        assert!(tl.phase(12.5).abs() < 1e-12);
    }

    #[test]
    fn test_phase_wraps_at_period() {
        let tl = BreathTimeline::new(0.0);
        let p = tl.phase(BREATH_PERIOD);
        assert!(p.abs() < 1e-9 || (1.0 - p) < 1e-9);
    }

    #[test]
    fn test_phase_monotonic_within_cycle() {
        let tl = BreathTimeline::new(0.0);
        let mut last = -1.0;
        let steps = 100;
        for i in 0..steps {
            let t = i as f64 * BREATH_PERIOD / steps as f64;
            let p = tl.phase(t);
            assert!(p > last, "phase must increase within one period");
            last = p;
        }
    }

    #[test]
    fn test_cycle_index() {
        let tl = BreathTimeline::new(0.0);
        assert_eq!(tl.cycle_index(0.0), 0);
        assert_eq!(tl.cycle_index(BREATH_PERIOD - 1e-6), 0);
        assert_eq!(tl.cycle_index(BREATH_PERIOD + 1e-6), 1);
        assert_eq!(tl.cycle_index(3.5 * BREATH_PERIOD), 3);
        assert_eq!(tl.cycle_index(-0.1), -1);
    }

    #[test]
    fn test_correction_is_clamped_and_spread() {
        let mut tl = BreathTimeline::new(0.0);
        tl.apply_correction(1e9); // absurd request
        // Ramp it all the way in.
        let mut now = 0.0;
        for _ in 0..200 {
            now += 0.05;
            tl.advance(now, 0.05);
        }
        let max_ratio = 1.0 + MAX_CORRECTION_PPM / CORRECTION_SPREAD * 1e-6;
        assert!(tl.period() <= BREATH_PERIOD * max_ratio + 1e-9);
        assert!(tl.period() > BREATH_PERIOD);
    }

    #[test]
    fn test_correction_never_steps_phase() {
        let mut tl = BreathTimeline::new(0.0);
        let now = 4.0;
        let before = tl.phase(now);
        tl.apply_correction(300.0);
        tl.advance(now, 0.016);
        let after = tl.phase(now);
        assert!((before - after).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_correction_ignored() {
        let mut tl = BreathTimeline::new(0.0);
        tl.apply_correction(f64::NAN);
        tl.advance(1.0, 0.1);
        assert_eq!(tl.period(), BREATH_PERIOD);
    }
}
