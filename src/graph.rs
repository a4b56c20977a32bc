//! Audio graph construction and per-sample rendering
//!
//! One `AudioGraph` owns every node of the session: the harmonic
//! oscillator bank, the dry/wet split, the shared convolution and
//! feedback-delay effects, and the output protection chain. The graph is
//! built atomically on `play()` and consumed atomically on `stop()`; no
//! node is shared across two sessions. The delay feedback loop is the
//! only cycle in the topology, and its gain is hard-capped below unity.

use crate::harmonics::HarmonicEntry;
use crate::param::Smoothed;
use arc_swap::ArcSwapOption;
use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type, Q_BUTTERWORTH_F32};
use std::f32::consts::{PI, SQRT_2};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Delay feedback never reaches unity, so the loop always decays.
pub const FEEDBACK_CAP: f32 = 0.9;

/// Fixed master ceiling below unity.
pub const MASTER_GAIN: f32 = 0.75;

/// The anti-alias low-pass engages only below this output rate.
pub const LOWPASS_ENGAGE_BELOW_HZ: f32 = 44_100.0;

/// DC-blocking high-pass corner.
pub const DC_BLOCK_HZ: f32 = 12.0;

/// Differential L/R dry delay for the stereo-width enhancement. Sub-15 ms.
pub const WIDTH_DELAY_SECS: f32 = 0.009;

/// Cosine fade-in length for every oscillator.
pub const FADE_IN_SECS: f32 = 1.5;

/// Delay-line headroom above the largest automatable delay time.
pub const MAX_DELAY_SECS: f32 = 1.3;

/// Direct-form convolution cap.
// TODO: partitioned FFT convolution; direct form caps the usable IR length.
pub const IR_MAX_TAPS: usize = 4096;

/// Optional signal-chain branches. Each flag contributes independently;
/// the builder inserts stages one by one, with no cross-flag coupling.
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Split each harmonic into a detuned hard-panned pair.
    pub binaural: bool,
    /// Perceived binaural beat frequency for the pair spacing.
    pub beat_hz: f64,
    /// Differential dry-path delay between channels.
    pub stereo_width: bool,
    /// Slow random walk of each voice's pan position.
    pub spatial_drift: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            binaural: true,
            beat_hz: 6.0,
            stereo_width: true,
            spatial_drift: false,
        }
    }
}

/// Counts live node handles, for leak accounting across play/stop cycles.
#[derive(Debug, Clone, Default)]
pub struct NodeCounter(Arc<AtomicUsize>);

impl NodeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn acquire(&self) -> Self {
        self.0.fetch_add(1, Ordering::Relaxed);
        self.clone()
    }

    fn release(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// fundsp sine wrapped behind a tick closure, so the graph stores units
/// without exposing their concrete generic types.
struct SineUnit {
    tick_fn: Box<dyn FnMut() -> f32 + Send>,
    frequency_hz: f32,
}

impl SineUnit {
    fn new(frequency_hz: f32, sample_rate: f64) -> Self {
        let mut unit = fundsp::prelude::sine_hz(frequency_hz);
        unit.reset();
        unit.set_sample_rate(sample_rate);
        let tick_fn = Box::new(move || -> f32 {
            let frame = unit.tick(&Default::default());
            frame[0]
        });
        Self {
            tick_fn,
            frequency_hz,
        }
    }

    fn tick(&mut self) -> f32 {
        (self.tick_fn)()
    }
}

enum VoiceOsc {
    Mono(SineUnit),
    /// Detuned pair producing the binaural beat. Nominally hard-panned
    /// opposite; the voice pan tilts the pair's balance so spatial drift
    /// reads through in binaural mode too.
    Pair { left: SineUnit, right: SineUnit },
}

/// One signal path of the harmonic bank.
struct HarmonicVoice {
    osc: VoiceOsc,
    gain: f32,
    /// Equal-power pan position in [-1, 1], from the spiral placement.
    pan: f32,
    /// Samples to wait before the fade-in starts (breath alignment).
    start_delay: u64,
    fade_len: u64,
    age: u64,
    _handle: NodeCounter,
}

impl HarmonicVoice {
    fn envelope(&self) -> f32 {
        if self.age < self.start_delay {
            0.0
        } else {
            let t = self.age - self.start_delay;
            if t >= self.fade_len {
                1.0
            } else {
                0.5 * (1.0 - (PI * t as f32 / self.fade_len as f32).cos())
            }
        }
    }

    /// Advance one sample: (left, right) panned output plus the mono
    /// pre-pan signal used for the wet send.
    fn tick(&mut self) -> (f32, f32, f32) {
        let env = self.envelope() * self.gain;
        self.age += 1;
        if env == 0.0 {
            // Keep oscillator phase advancing so the fade-in starts
            // mid-waveform, not from a reset.
            match &mut self.osc {
                VoiceOsc::Mono(unit) => {
                    unit.tick();
                }
                VoiceOsc::Pair { left, right } => {
                    left.tick();
                    right.tick();
                }
            }
            return (0.0, 0.0, 0.0);
        }
        match &mut self.osc {
            VoiceOsc::Mono(unit) => {
                let s = unit.tick() * env;
                let (gl, gr) = equal_power(self.pan);
                (s * gl, s * gr, s)
            }
            VoiceOsc::Pair { left, right } => {
                // Gain tilt from the pan position, unity at center.
                let (gl, gr) = equal_power(self.pan);
                let l = left.tick() * env * gl * SQRT_2;
                let r = right.tick() * env * gr * SQRT_2;
                (l, r, 0.5 * (l + r))
            }
        }
    }
}

impl Drop for HarmonicVoice {
    fn drop(&mut self) {
        self._handle.release();
    }
}

fn equal_power(pan: f32) -> (f32, f32) {
    let a = (pan.clamp(-1.0, 1.0) + 1.0) * PI / 4.0;
    (a.cos(), a.sin())
}

/// Direct-form FIR convolver. An absent buffer produces silence: the wet
/// stage stays connected but contributes nothing, so IR fetch failure
/// degrades to dry-only without rebuilding anything.
struct Convolver {
    ir: Arc<ArcSwapOption<Vec<f32>>>,
    history: Vec<f32>,
    write: usize,
}

impl Convolver {
    fn new(ir: Arc<ArcSwapOption<Vec<f32>>>) -> Self {
        Self {
            ir,
            history: vec![0.0; IR_MAX_TAPS],
            write: 0,
        }
    }

    fn tick(&mut self, input: f32) -> f32 {
        self.history[self.write] = input;
        let out = match self.ir.load_full() {
            Some(ir) => {
                let taps = ir.len().min(self.history.len());
                let len = self.history.len();
                let mut acc = 0.0f32;
                for (k, &coeff) in ir.iter().take(taps).enumerate() {
                    acc += coeff * self.history[(self.write + len - k) % len];
                }
                acc
            }
            None => 0.0,
        };
        self.write = (self.write + 1) % self.history.len();
        out
    }
}

/// Feedback delay line — the one deliberate cycle in the graph.
struct DelayLine {
    buffer: Vec<f32>,
    write: usize,
    time: Smoothed,
    feedback: Smoothed,
    sample_rate: f32,
}

impl DelayLine {
    fn new(time_secs: f32, feedback: f32, sample_rate: f32) -> Self {
        let len = (MAX_DELAY_SECS * sample_rate).ceil() as usize + 2;
        let mut time = Smoothed::new(0.0);
        time.snap(time_secs);
        let mut fb = Smoothed::new(0.0);
        fb.snap(feedback.min(FEEDBACK_CAP));
        Self {
            buffer: vec![0.0; len],
            write: 0,
            time,
            feedback: fb,
            sample_rate,
        }
    }

    fn tick(&mut self, input: f32) -> f32 {
        let len = self.buffer.len();
        let delay_samples = (self.time.tick() * self.sample_rate)
            .clamp(1.0, (len - 2) as f32);
        let read = self.write as f32 + len as f32 - delay_samples;
        let idx = read.floor() as usize % len;
        let frac = read - read.floor();
        let a = self.buffer[idx];
        let b = self.buffer[(idx + 1) % len];
        let out = a * (1.0 - frac) + b * frac;
        let fb = self.feedback.tick().min(FEEDBACK_CAP);
        self.buffer[self.write] = input + out * fb;
        self.write = (self.write + 1) % len;
        out
    }
}

/// Fixed delay applied to one dry channel for width.
struct WidthRing {
    buffer: Vec<f32>,
    write: usize,
}

impl WidthRing {
    fn new(sample_rate: f32) -> Self {
        let len = ((WIDTH_DELAY_SECS * sample_rate) as usize).max(1);
        Self {
            buffer: vec![0.0; len],
            write: 0,
        }
    }

    fn tick(&mut self, input: f32) -> f32 {
        let out = self.buffer[self.write];
        self.buffer[self.write] = input;
        self.write = (self.write + 1) % self.buffer.len();
        out
    }
}

/// Stereo-linked soft limiter: envelope follower plus a soft-knee gain
/// reduction above threshold.
struct SoftLimiter {
    threshold: f32,
    ratio: f32,
    envelope: f32,
    attack: f32,
    release: f32,
}

impl SoftLimiter {
    fn new(sample_rate: f32) -> Self {
        Self {
            threshold: 0.8,
            ratio: 4.0,
            envelope: 0.0,
            attack: coeff(0.005, sample_rate),
            release: coeff(0.120, sample_rate),
        }
    }

    fn tick(&mut self, l: f32, r: f32) -> (f32, f32) {
        let peak = l.abs().max(r.abs());
        let c = if peak > self.envelope {
            self.attack
        } else {
            self.release
        };
        self.envelope = c * self.envelope + (1.0 - c) * peak;
        let gain = if self.envelope > self.threshold {
            (self.threshold + (self.envelope - self.threshold) / self.ratio) / self.envelope
        } else {
            1.0
        };
        (l * gain, r * gain)
    }
}

fn coeff(time_secs: f32, sample_rate: f32) -> f32 {
    (-1.0 / (time_secs * sample_rate)).exp()
}

/// Running output meter, read-only to collaborators.
#[derive(Debug, Default, Clone, Copy)]
pub struct Meter {
    pub rms: f32,
    pub peak: f32,
}

/// The full signal topology of one playing session.
pub struct AudioGraph {
    sample_rate: f32,
    voices: Vec<HarmonicVoice>,
    dry_gain: Smoothed,
    wet_gain: Smoothed,
    master: Smoothed,
    ir_handle: Arc<ArcSwapOption<Vec<f32>>>,
    convolver: Convolver,
    delay: DelayLine,
    width: Option<WidthRing>,
    lowpass: Option<[DirectForm1<f32>; 2]>,
    dc_block: [DirectForm1<f32>; 2],
    limiter: SoftLimiter,
    meter: Meter,
    spatial_drift: bool,
    frames: u64,
}

impl AudioGraph {
    /// Construct every node of the session. `start_delay_secs` defers the
    /// first audible sample to the next breath boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        entries: &[HarmonicEntry],
        wet_ratio: f64,
        delay_seconds: f64,
        feedback: f32,
        ir: Option<Arc<Vec<f32>>>,
        options: &GraphOptions,
        sample_rate: f32,
        start_delay_secs: f64,
        counter: &NodeCounter,
    ) -> Result<Self, String> {
        if entries.is_empty() {
            return Err("cannot build a graph with no harmonic entries".to_string());
        }
        if !(sample_rate > 0.0) {
            return Err(format!("invalid sample rate {}", sample_rate));
        }

        let start_delay = (start_delay_secs.max(0.0) * sample_rate as f64) as u64;
        let fade_len = (FADE_IN_SECS * sample_rate).max(1.0) as u64;
        let mut voices = Vec::with_capacity(entries.len());
        for entry in entries {
            let pan = spiral_pan(entry.position);
            let osc = if options.binaural {
                let half_beat = options.beat_hz / 2.0;
                let lo = (entry.frequency_hz - half_beat).max(1.0) as f32;
                let hi = (entry.frequency_hz + half_beat) as f32;
                VoiceOsc::Pair {
                    left: SineUnit::new(lo, sample_rate as f64),
                    right: SineUnit::new(hi, sample_rate as f64),
                }
            } else {
                VoiceOsc::Mono(SineUnit::new(entry.frequency_hz as f32, sample_rate as f64))
            };
            voices.push(HarmonicVoice {
                osc,
                gain: entry.gain,
                pan,
                start_delay,
                fade_len,
                age: 0,
                _handle: counter.acquire(),
            });
        }

        let mut dry_gain = Smoothed::new(0.0);
        dry_gain.snap(1.0 - wet_ratio as f32);
        let mut wet_gain = Smoothed::new(0.0);
        wet_gain.snap(wet_ratio as f32);
        let mut master = Smoothed::new(0.0);
        master.snap(MASTER_GAIN);

        let ir_handle = Arc::new(ArcSwapOption::empty());
        if let Some(buffer) = ir {
            store_impulse(&ir_handle, buffer);
        } else {
            warn!("no impulse response available, wet stage runs dry-only");
        }

        let lowpass = if sample_rate < LOWPASS_ENGAGE_BELOW_HZ {
            let cutoff = (sample_rate * 0.45).min(16_000.0);
            Some([
                make_filter(Type::LowPass, cutoff, sample_rate)?,
                make_filter(Type::LowPass, cutoff, sample_rate)?,
            ])
        } else {
            None
        };
        let dc_block = [
            make_filter(Type::HighPass, DC_BLOCK_HZ, sample_rate)?,
            make_filter(Type::HighPass, DC_BLOCK_HZ, sample_rate)?,
        ];

        Ok(Self {
            sample_rate,
            voices,
            dry_gain,
            wet_gain,
            master,
            convolver: Convolver::new(Arc::clone(&ir_handle)),
            ir_handle,
            delay: DelayLine::new(delay_seconds as f32, feedback, sample_rate),
            width: options.stereo_width.then(|| WidthRing::new(sample_rate)),
            lowpass,
            dc_block,
            limiter: SoftLimiter::new(sample_rate),
            meter: Meter::default(),
            spatial_drift: options.spatial_drift,
            frames: 0,
        })
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn meter(&self) -> Meter {
        self.meter
    }

    /// Retarget the wet/dry balance; the dry bus always tracks `1 - wet`.
    pub fn set_mix_target(&mut self, wet: f32, ramp_secs: f32, elapsed_secs: f32) {
        let wet = wet.clamp(0.0, 1.0);
        self.wet_gain
            .set_target_from(wet, ramp_secs, elapsed_secs, self.sample_rate);
        self.dry_gain
            .set_target_from(1.0 - wet, ramp_secs, elapsed_secs, self.sample_rate);
    }

    pub fn set_delay_time_target(&mut self, secs: f32, ramp_secs: f32, elapsed_secs: f32) {
        self.delay.time.set_target_from(
            secs.clamp(0.0, MAX_DELAY_SECS),
            ramp_secs,
            elapsed_secs,
            self.sample_rate,
        );
    }

    pub fn set_feedback_target(&mut self, feedback: f32, ramp_secs: f32, elapsed_secs: f32) {
        self.delay.feedback.set_target_from(
            feedback.min(FEEDBACK_CAP),
            ramp_secs,
            elapsed_secs,
            self.sample_rate,
        );
    }

    /// Ramp every bus to silence. Teardown may only happen after this
    /// ramp completes; disconnecting live nodes clicks.
    pub fn fade_out(&mut self, fade_secs: f32) {
        let sr = self.sample_rate;
        self.dry_gain.set_target(0.0, fade_secs, sr);
        self.wet_gain.set_target(0.0, fade_secs, sr);
        self.master.set_target(0.0, fade_secs, sr);
    }

    pub fn is_faded_out(&self) -> bool {
        !self.master.is_ramping() && self.master.value() <= 1e-4
    }

    pub fn wet_gain_value(&self) -> f32 {
        self.wet_gain.value()
    }

    pub fn delay_time_value(&self) -> f32 {
        self.delay.time.value()
    }

    pub fn feedback_value(&self) -> f32 {
        self.delay.feedback.value()
    }

    pub fn has_impulse(&self) -> bool {
        self.ir_handle.load_full().is_some()
    }

    /// Swap the convolver buffer live, without rebuilding the graph.
    pub fn swap_impulse(&mut self, ir: Option<Arc<Vec<f32>>>) {
        match ir {
            Some(buffer) => store_impulse(&self.ir_handle, buffer),
            None => self.ir_handle.store(None),
        }
    }

    /// Render one stereo frame.
    pub fn process_frame(&mut self) -> (f32, f32) {
        if self.spatial_drift && self.frames % 512 == 0 {
            for voice in &mut self.voices {
                voice.pan = (voice.pan + (fastrand::f32() - 0.5) * 0.004).clamp(-0.9, 0.9);
            }
        }

        let mut dry_l = 0.0f32;
        let mut dry_r = 0.0f32;
        let mut send = 0.0f32;
        for voice in &mut self.voices {
            let (l, r, mono) = voice.tick();
            dry_l += l;
            dry_r += r;
            send += mono;
        }

        let wet = self.convolver.tick(send) + self.delay.tick(send);
        if let Some(width) = &mut self.width {
            dry_r = width.tick(dry_r);
        }
        let dg = self.dry_gain.tick();
        let wg = self.wet_gain.tick();
        let mut l = dry_l * dg + wet * wg;
        let mut r = dry_r * dg + wet * wg;

        if let Some([lp_l, lp_r]) = &mut self.lowpass {
            l = lp_l.run(l);
            r = lp_r.run(r);
        }
        l = self.dc_block[0].run(l);
        r = self.dc_block[1].run(r);
        let (l, r) = self.limiter.tick(l, r);
        let m = self.master.tick();
        let (l, r) = (l * m, r * m);

        let level = 0.5 * (l * l + r * r);
        self.meter.rms = 0.999 * self.meter.rms + 0.001 * level.sqrt();
        self.meter.peak = self.meter.peak.max(l.abs().max(r.abs()));
        self.frames += 1;
        (l, r)
    }

    /// Render `n` frames. Test and analysis helper; the realtime path
    /// calls `process_frame` from the output callback.
    pub fn render(&mut self, n: usize) -> Vec<(f32, f32)> {
        (0..n).map(|_| self.process_frame()).collect()
    }
}

fn store_impulse(handle: &ArcSwapOption<Vec<f32>>, buffer: Arc<Vec<f32>>) {
    if buffer.is_empty() || buffer.iter().any(|s| !s.is_finite()) {
        warn!("impulse response empty or invalid, wet stage runs dry-only");
        handle.store(None);
        return;
    }
    if buffer.len() > IR_MAX_TAPS {
        warn!(
            "impulse response truncated from {} to {} taps",
            buffer.len(),
            IR_MAX_TAPS
        );
    }
    let mut ir: Vec<f32> = buffer.iter().take(IR_MAX_TAPS).copied().collect();
    // Bound the convolver's worst-case gain at unity so a hot IR cannot
    // defeat the headroom reservation.
    let l1: f32 = ir.iter().map(|s| s.abs()).sum();
    if l1 > 1.0 {
        for s in &mut ir {
            *s /= l1;
        }
    }
    handle.store(Some(Arc::new(ir)));
}

fn spiral_pan(position: [f32; 3]) -> f32 {
    let radius = (position[0] * position[0] + position[2] * position[2]).sqrt();
    if radius <= f32::EPSILON {
        0.0
    } else {
        (position[0] / radius).clamp(-1.0, 1.0)
    }
}

fn make_filter(
    kind: Type<f32>,
    cutoff_hz: f32,
    sample_rate: f32,
) -> Result<DirectForm1<f32>, String> {
    let coeffs = Coefficients::<f32>::from_params(
        kind,
        sample_rate.hz(),
        cutoff_hz.hz(),
        Q_BUTTERWORTH_F32,
    )
    .map_err(|e| format!("filter design failed: {:?}", e))?;
    Ok(DirectForm1::<f32>::new(coeffs))
}
