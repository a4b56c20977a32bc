//! Property-style sweeps over the parameter derivation: the bounds and
//! orderings must hold for any input, not just the presets we ship.

use pneuma::harmonics::{build_harmonics, HarmonicRole, QualityTier, TOTAL_GAIN};
use pneuma::modulation::{
    compute_delay, compute_wet, derive, ModulationSnapshot, DELAY_MAX, DELAY_MIN, WET_CAP,
    WET_FLOOR,
};
use pneuma::presets::Presets;

fn snapshot(freq: f64, phrase: &str, clock: f64, breath: f64) -> ModulationSnapshot {
    ModulationSnapshot {
        frequency_hz: freq,
        phrase: phrase.to_string(),
        clock_value: clock,
        breath_phase: breath,
    }
}

#[test]
fn test_wet_ratio_always_within_bounds() {
    let presets = Presets::builtin();
    let phrases = ["Rah Voh Lah", "Soh Ahm", "", "no such phrase", "Keh Rah Voh"];
    for &freq in &[0.1, 1.0, 53.8, 144.0, 377.0, 1000.0, 20_000.0] {
        for phrase in phrases {
            for i in 0..40 {
                let clock = i as f64 * 173.3 - 2000.0;
                let breath = (i as f64 * 0.137) % 1.0;
                let wet = compute_wet(&snapshot(freq, phrase, clock, breath), &presets);
                assert!(
                    (WET_FLOOR..=WET_CAP).contains(&wet),
                    "wet {} out of bounds for f={} phrase={:?} clock={} breath={}",
                    wet,
                    freq,
                    phrase,
                    clock,
                    breath
                );
            }
        }
    }
}

#[test]
fn test_delay_always_within_bounds() {
    let presets = Presets::builtin();
    for &freq in &[0.5, 53.8, 233.0, 5_000.0] {
        for &wet in &[WET_FLOOR, 0.1, 0.3, WET_CAP * 0.995] {
            let delay = compute_delay(freq, "Soh Ahm", wet, &presets);
            assert!(
                (DELAY_MIN..=DELAY_MAX).contains(&delay),
                "delay {} out of bounds",
                delay
            );
        }
    }
}

#[test]
fn test_wetter_mixes_get_shorter_delays() {
    let presets = Presets::builtin();
    let dry = compute_delay(53.8, "Rah Voh Lah", 0.05, &presets);
    let wet = compute_delay(53.8, "Rah Voh Lah", WET_CAP * 0.99, &presets);
    assert!(
        wet < dry,
        "delay must shrink as wet rises: {} !< {}",
        wet,
        dry
    );
}

#[test]
fn test_phrase_weight_dominates_clock() {
    let presets = Presets::builtin();
    // Strongest vs weakest phrase at identical ambient conditions.
    let strong = compute_wet(&snapshot(53.8, "Keh Rah Voh", 10.0, 0.25), &presets);
    let weak = compute_wet(&snapshot(53.8, "Nah Veh Om", 10.0, 0.25), &presets);
    assert!(strong > weak);

    // A full clock sweep moves the result less than the phrase swap did.
    let phrase_span = strong - weak;
    let mut clock_min = f64::MAX;
    let mut clock_max = f64::MIN;
    for i in 0..200 {
        let wet = compute_wet(&snapshot(53.8, "Soh Ahm", i as f64 * 2.0, 0.25), &presets);
        clock_min = clock_min.min(wet);
        clock_max = clock_max.max(wet);
    }
    assert!(
        clock_max - clock_min < phrase_span,
        "clock influence ({}) must stay below phrase influence ({})",
        clock_max - clock_min,
        phrase_span
    );
}

#[test]
fn test_derivation_is_deterministic() {
    let presets = Presets::builtin();
    let snap = snapshot(53.8, "Rah Voh Lah", 42.0, 0.6);
    let a = derive(&snap, &presets);
    let b = derive(&snap, &presets);
    assert_eq!(a, b);
}

#[test]
fn test_unknown_phrase_falls_back_to_band() {
    let presets = Presets::builtin();
    let named = compute_wet(&snapshot(53.8, "Rah Voh Lah", 0.0, 0.0), &presets);
    let unknown = compute_wet(&snapshot(53.8, "zzz unknown", 0.0, 0.0), &presets);
    // 53.8 Hz sits in the lowest band, whose weight differs from the
    // named phrase's, so the two derivations must not collapse together.
    assert!((named - unknown).abs() > 1e-6);
    assert!((WET_FLOOR..=WET_CAP).contains(&unknown));
}

#[test]
fn test_harmonic_bank_energy_stays_bounded() {
    for &freq in &[27.5, 53.8, 110.0, 261.6] {
        for tier in [QualityTier::Low, QualityTier::Medium, QualityTier::High] {
            let entries = build_harmonics(freq, tier, 48_000.0).unwrap();
            let total: f64 = entries.iter().map(|e| e.gain as f64).sum();
            assert!(
                (total - TOTAL_GAIN as f64).abs() < 1e-5,
                "f={} tier={:?} total gain {} != {}",
                freq,
                tier,
                total,
                TOTAL_GAIN
            );
            assert!(entries
                .iter()
                .all(|e| e.frequency_hz > 0.0 && e.frequency_hz < 24_000.0));
        }
    }
}

#[test]
fn test_quality_tiers_order_voice_counts() {
    let low = build_harmonics(53.8, QualityTier::Low, 48_000.0).unwrap().len();
    let mid = build_harmonics(53.8, QualityTier::Medium, 48_000.0)
        .unwrap()
        .len();
    let high = build_harmonics(53.8, QualityTier::High, 48_000.0)
        .unwrap()
        .len();
    assert!(low <= mid && mid <= high);
    assert!(low >= 1);

    // The fundamental survives every tier.
    let entries = build_harmonics(53.8, QualityTier::Low, 48_000.0).unwrap();
    assert!(entries
        .iter()
        .any(|e| e.role == HarmonicRole::Overtone && (e.frequency_hz - 53.8).abs() < 1e-9));
}
