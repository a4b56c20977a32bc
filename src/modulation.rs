//! Wet-ratio and delay-time derivation
//!
//! Pure functions mapping (frequency, phrase, external clock, breath phase)
//! to the reverb wet mix and the complementary delay time. No I/O, fully
//! deterministic; everything downstream of these numbers is automation.

use crate::breath::BREATH_PERIOD;
use crate::presets::Presets;
use std::f64::consts::PI;

/// Hard ceiling on the wet mix: headroom reserved for the dry path.
pub const WET_CAP: f64 = 0.6;

/// Lower bound so the reverb tail never fully disappears.
pub const WET_FLOOR: f64 = 0.01;

/// Delay time bounds in seconds.
pub const DELAY_MIN: f64 = 0.02;
pub const DELAY_MAX: f64 = 1.25;

/// Fibonacci bound used to normalize log-frequency position.
pub const HARMONIC_SPAN_HZ: f64 = 377.0;

/// The external clock is folded modulo this many breath periods.
pub const CLOCK_STEP_BREATHS: f64 = 11.0;

const PHI: f64 = 1.618_033_988_749_895;

/// Mix between the logistic soft-knee and the square-root curve in the
/// clarity easing.
const EASE_LOGISTIC_SHARE: f64 = 0.55;
const EASE_KNEE_STEEPNESS: f64 = 6.0;

/// Instantaneous inputs driving all effect parameters. Immutable per
/// evaluation; recomputed on every modulation tick.
#[derive(Debug, Clone)]
pub struct ModulationSnapshot {
    /// Base oscillator frequency in Hz, must be positive.
    pub frequency_hz: f64,
    /// Symbolic phrase key, resolved through the preset tables.
    pub phrase: String,
    /// Externally supplied clock value in seconds.
    pub clock_value: f64,
    /// Breath phase in [0, 1).
    pub breath_phase: f64,
}

/// Derived effect parameters for one snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Derivation {
    pub wet_ratio: f64,
    pub delay_seconds: f64,
}

/// Compute the reverb wet mix for a snapshot.
///
/// Four signals are normalized to [0, 1] and combined with descending
/// golden-ratio-power weights: phrase intent dominates, ambient clock
/// drift is the weakest influence. A logistic soft-knee blended with a
/// square-root curve compresses extremes toward mid-range, and the result
/// is scaled just under the wet ceiling.
pub fn compute_wet(snapshot: &ModulationSnapshot, presets: &Presets) -> f64 {
    let freq = snapshot.frequency_hz.max(f64::MIN_POSITIVE);

    // (a) log-scaled frequency position, saturating at the span bound.
    let freq_term = (freq.ln() / HARMONIC_SPAN_HZ.ln()).clamp(0.0, 1.0);

    // (b) phrase reverb weight, normalized by the table maximum.
    let preset = presets.resolve(&snapshot.phrase, freq);
    let max_weight = presets.max_reverb_weight().max(f64::MIN_POSITIVE);
    let phrase_term = (preset.reverb_weight / max_weight).clamp(0.0, 1.0);

    // (c) external clock folded into an 11-breath step.
    let step = CLOCK_STEP_BREATHS * BREATH_PERIOD;
    let clock_term = if snapshot.clock_value.is_finite() {
        snapshot.clock_value.rem_euclid(step) / step
    } else {
        0.0
    };

    // (d) sinusoidal transform of breath phase.
    let breath_term = 0.5 - 0.5 * (2.0 * PI * snapshot.breath_phase.rem_euclid(1.0)).cos();

    // Golden-ratio-power weights, descending: phrase, frequency, breath,
    // clock.
    let weights = [PHI.powi(-1), PHI.powi(-2), PHI.powi(-3), PHI.powi(-4)];
    let total: f64 = weights.iter().sum();
    let blended = (phrase_term * weights[0]
        + freq_term * weights[1]
        + breath_term * weights[2]
        + clock_term * weights[3])
        / total;

    let eased = clarity_ease(blended.clamp(0.0, 1.0));
    WET_FLOOR + eased * (WET_CAP * 0.995 - WET_FLOOR)
}

/// Compute the delay time complementary to a wet ratio.
///
/// The base preset is clamped to `DELAY_MAX` and shrunk as reverb density
/// grows, so long tails and long discrete echoes never stack. Floored at
/// `DELAY_MIN`.
pub fn compute_delay(frequency_hz: f64, phrase: &str, wet_ratio: f64, presets: &Presets) -> f64 {
    let base = presets.resolve(phrase, frequency_hz).delay_seconds;
    let base = base.clamp(DELAY_MIN, DELAY_MAX);
    let headroom = (1.0 - wet_ratio / WET_CAP).max(0.0);
    (base * headroom.sqrt()).max(DELAY_MIN)
}

/// Full derivation for one snapshot.
pub fn derive(snapshot: &ModulationSnapshot, presets: &Presets) -> Derivation {
    let wet_ratio = compute_wet(snapshot, presets);
    let delay_seconds = compute_delay(snapshot.frequency_hz, &snapshot.phrase, wet_ratio, presets);
    Derivation {
        wet_ratio,
        delay_seconds,
    }
}

/// Logistic soft-knee centered at the midpoint, renormalized to span
/// [0, 1], blended 55/45 with a square-root curve.
fn clarity_ease(x: f64) -> f64 {
    let sig = |v: f64| 1.0 / (1.0 + (-EASE_KNEE_STEEPNESS * (v - 0.5)).exp());
    let lo = sig(0.0);
    let hi = sig(1.0);
    let logistic = (sig(x) - lo) / (hi - lo);
    EASE_LOGISTIC_SHARE * logistic + (1.0 - EASE_LOGISTIC_SHARE) * x.sqrt()
}
