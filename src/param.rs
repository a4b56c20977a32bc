//! Click-free parameter automation
//!
//! Every retargetable value in the audio graph is a `Smoothed`: a current
//! value plus a linear ramp toward a target. Retargeting mid-ramp is fine;
//! the ramp restarts from the current value, so the signal never steps.

#[derive(Debug, Clone)]
pub struct Smoothed {
    current: f32,
    target: f32,
    step: f32,
    remaining: u32,
}

impl Smoothed {
    pub fn new(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            step: 0.0,
            remaining: 0,
        }
    }

    /// Current value without advancing the ramp.
    pub fn value(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn is_ramping(&self) -> bool {
        self.remaining > 0
    }

    /// Jump immediately. Only for construction time, before audio flows.
    pub fn snap(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.remaining = 0;
        self.step = 0.0;
    }

    /// Ramp linearly to `target` over `ramp_secs`.
    pub fn set_target(&mut self, target: f32, ramp_secs: f32, sample_rate: f32) {
        self.set_target_from(target, ramp_secs, 0.0, sample_rate);
    }

    /// Ramp to `target` as if the ramp had started `elapsed_secs` ago.
    /// Used for breath-boundary events detected late by the poll loop:
    /// the ramp is anchored to the boundary timestamp, not the poll time.
    pub fn set_target_from(
        &mut self,
        target: f32,
        ramp_secs: f32,
        elapsed_secs: f32,
        sample_rate: f32,
    ) {
        self.target = target;
        let total = (ramp_secs * sample_rate).max(1.0) as u32;
        self.remaining = total;
        self.step = (target - self.current) / total as f32;
        let skip = ((elapsed_secs * sample_rate) as u32).min(total);
        for _ in 0..skip {
            self.tick();
        }
    }

    /// Advance one sample and return the value.
    pub fn tick(&mut self) -> f32 {
        if self.remaining > 0 {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.current = self.target;
            } else {
                self.current += self.step;
            }
        }
        self.current
    }
}
