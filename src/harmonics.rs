//! Fibonacci harmonic bank generation
//!
//! Builds the overtone/undertone table for a base frequency: a Fibonacci
//! index sequence produces partner frequencies above and below the
//! fundamental, gains are normalized to a fixed total-energy ceiling, and
//! each entry is placed on a Fibonacci spiral so successive harmonics are
//! separated in space as well as frequency.

/// Total of all entry gains, independent of series length. Keeps loudness
/// constant across quality tiers and frequency bands.
pub const TOTAL_GAIN: f32 = 0.85;

/// Undertones below this are discarded as subsonic.
pub const SUBSONIC_FLOOR_HZ: f64 = 20.0;

/// Shortest series a constrained device is allowed to shave down to.
pub const MIN_SERIES_LEN: usize = 5;

/// Spiral placement: successive entries advance by this angle.
const SPIRAL_ANGLE_DEG: f64 = 144.0;

/// Explicit quality tier supplied by the caller, replacing heuristic
/// device detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarmonicRole {
    Overtone,
    Undertone,
}

/// One oscillator of the harmonic bank.
#[derive(Debug, Clone)]
pub struct HarmonicEntry {
    pub frequency_hz: f64,
    pub gain: f32,
    /// Spiral position: x/z in the listener plane, y is elevation.
    pub position: [f32; 3],
    pub role: HarmonicRole,
}

/// Series length for a frequency band, before tier shaving. Band edges
/// follow the Fibonacci sequence.
fn band_series_len(base_freq_hz: f64) -> usize {
    if base_freq_hz < 89.0 {
        5
    } else if base_freq_hz < 144.0 {
        8
    } else if base_freq_hz < 233.0 {
        13
    } else {
        21
    }
}

fn shave_for_tier(len: usize, tier: QualityTier) -> usize {
    const LADDER: [usize; 4] = [5, 8, 13, 21];
    let pos = LADDER.iter().position(|&n| n == len).unwrap_or(0);
    let steps = match tier {
        QualityTier::High => 0,
        QualityTier::Medium => 1,
        QualityTier::Low => 2,
    };
    LADDER[pos.saturating_sub(steps)].max(MIN_SERIES_LEN)
}

/// Build the harmonic bank for a base frequency.
///
/// Overtones at or above Nyquist and undertones at or below the subsonic
/// floor are dropped; surviving gains are renormalized so their sum is
/// exactly `TOTAL_GAIN`. Returns an error only when nothing survives
/// (a base frequency far outside the audible range).
pub fn build_harmonics(
    base_freq_hz: f64,
    tier: QualityTier,
    sample_rate: f32,
) -> Result<Vec<HarmonicEntry>, String> {
    if !(base_freq_hz > 0.0) || !base_freq_hz.is_finite() {
        return Err(format!("base frequency must be positive, got {}", base_freq_hz));
    }
    let len = shave_for_tier(band_series_len(base_freq_hz), tier);
    let nyquist = sample_rate as f64 / 2.0;

    // Fibonacci values 1, 2, 3, 5, 8, ...
    let mut fib = Vec::with_capacity(len);
    let (mut a, mut b) = (1u64, 2u64);
    for _ in 0..len {
        fib.push(a);
        let next = a + b;
        a = b;
        b = next;
    }

    let mut entries = Vec::with_capacity(len * 2);
    let mut weight_sum = 0.0f64;
    for (i, &f) in fib.iter().enumerate() {
        let weight = 1.0 / (i as f64 + 1.0);
        let angle = (i as f64 * SPIRAL_ANGLE_DEG).to_radians();
        let radius = (i + 1) as f32;
        let x = radius * angle.cos() as f32;
        let z = radius * angle.sin() as f32;

        let over = base_freq_hz * f as f64;
        if over < nyquist {
            entries.push((
                weight,
                HarmonicEntry {
                    frequency_hz: over,
                    gain: 0.0,
                    position: [x, 0.5, z],
                    role: HarmonicRole::Overtone,
                },
            ));
            weight_sum += weight;
        }

        // F=1 would duplicate the fundamental.
        if f > 1 {
            let under = base_freq_hz / f as f64;
            if under > SUBSONIC_FLOOR_HZ {
                entries.push((
                    weight,
                    HarmonicEntry {
                        frequency_hz: under,
                        gain: 0.0,
                        position: [x, -0.5, z],
                        role: HarmonicRole::Undertone,
                    },
                ));
                weight_sum += weight;
            }
        }
    }

    if entries.is_empty() || weight_sum <= 0.0 {
        return Err(format!(
            "no audible harmonics for base frequency {} Hz at {} Hz output",
            base_freq_hz, sample_rate
        ));
    }

    Ok(entries
        .into_iter()
        .map(|(weight, mut entry)| {
            entry.gain = TOTAL_GAIN * (weight / weight_sum) as f32;
            entry
        })
        .collect())
}
