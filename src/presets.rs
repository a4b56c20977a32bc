//! Phrase and frequency-band preset tables
//!
//! Each symbolic phrase carries a reverb weight and a base delay time.
//! Unknown phrases fall back to a frequency-band table, then to a fixed
//! default. Deployments can override the built-in tables with a TOML file.

use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;

/// Per-phrase effect weights.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PhrasePreset {
    /// Relative reverb density, normalized against the table maximum.
    pub reverb_weight: f64,
    /// Base delay time in seconds before wet-ratio scaling.
    pub delay_seconds: f64,
}

/// Frequency-band fallback entry. Applies to frequencies below `upper_hz`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BandPreset {
    pub upper_hz: f64,
    pub reverb_weight: f64,
    pub delay_seconds: f64,
}

/// The full preset surface: phrase table plus band fallbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct Presets {
    pub phrases: HashMap<String, PhrasePreset>,
    pub bands: Vec<BandPreset>,
    pub default: PhrasePreset,
}

lazy_static! {
    static ref BUILTIN: Presets = {
        let mut phrases = HashMap::new();
        phrases.insert(
            "rah-voh-lah".to_string(),
            PhrasePreset {
                reverb_weight: 0.85,
                delay_seconds: 0.62,
            },
        );
        phrases.insert(
            "soh-ahm".to_string(),
            PhrasePreset {
                reverb_weight: 0.55,
                delay_seconds: 0.34,
            },
        );
        phrases.insert(
            "veh-shah-rah".to_string(),
            PhrasePreset {
                reverb_weight: 0.70,
                delay_seconds: 0.48,
            },
        );
        phrases.insert(
            "nah-veh-om".to_string(),
            PhrasePreset {
                reverb_weight: 0.45,
                delay_seconds: 0.28,
            },
        );
        phrases.insert(
            "keh-rah-voh".to_string(),
            PhrasePreset {
                reverb_weight: 0.95,
                delay_seconds: 0.90,
            },
        );
        Presets {
            phrases,
            // Band edges follow the Fibonacci sequence used elsewhere in
            // the engine (89, 144, 233).
            bands: vec![
                BandPreset {
                    upper_hz: 89.0,
                    reverb_weight: 0.80,
                    delay_seconds: 0.75,
                },
                BandPreset {
                    upper_hz: 144.0,
                    reverb_weight: 0.65,
                    delay_seconds: 0.50,
                },
                BandPreset {
                    upper_hz: 233.0,
                    reverb_weight: 0.50,
                    delay_seconds: 0.32,
                },
                BandPreset {
                    upper_hz: f64::INFINITY,
                    reverb_weight: 0.40,
                    delay_seconds: 0.22,
                },
            ],
            default: PhrasePreset {
                reverb_weight: 0.60,
                delay_seconds: 0.45,
            },
        }
    };
}

/// Collapse a phrase into its slug form: lowercase, runs of
/// non-alphanumerics become single hyphens. Used for preset lookup,
/// cache keys, and impulse-response file paths.
pub fn slugify(phrase: &str) -> String {
    let mut slug = String::with_capacity(phrase.len());
    let mut pending_sep = false;
    for c in phrase.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            for lc in c.to_lowercase() {
                slug.push(lc);
            }
        } else {
            pending_sep = true;
        }
    }
    slug
}

impl Presets {
    /// The built-in tables.
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Parse a preset override file.
    pub fn from_toml_str(s: &str) -> Result<Self, String> {
        let presets: Presets =
            toml::from_str(s).map_err(|e| format!("invalid preset table: {}", e))?;
        if presets.bands.is_empty() {
            return Err("preset table needs at least one frequency band".to_string());
        }
        Ok(presets)
    }

    /// Look up a phrase by its slug form.
    pub fn phrase(&self, phrase: &str) -> Option<PhrasePreset> {
        self.phrases.get(&slugify(phrase)).copied()
    }

    /// Frequency-band fallback for a given base frequency.
    pub fn band(&self, frequency_hz: f64) -> PhrasePreset {
        for band in &self.bands {
            if frequency_hz < band.upper_hz {
                return PhrasePreset {
                    reverb_weight: band.reverb_weight,
                    delay_seconds: band.delay_seconds,
                };
            }
        }
        self.default
    }

    /// Phrase preset with the full fallback chain: phrase table, then
    /// frequency band, then the fixed default.
    pub fn resolve(&self, phrase: &str, frequency_hz: f64) -> PhrasePreset {
        self.phrase(phrase).unwrap_or_else(|| self.band(frequency_hz))
    }

    /// Largest reverb weight across the phrase table, used to normalize
    /// the phrase term of the wet-ratio derivation.
    pub fn max_reverb_weight(&self) -> f64 {
        self.phrases
            .values()
            .map(|p| p.reverb_weight)
            .fold(self.default.reverb_weight, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Rah Voh Lah"), "rah-voh-lah");
        assert_eq!(slugify("  Soh   Ahm  "), "soh-ahm");
        assert_eq!(slugify("rah-voh-lah"), "rah-voh-lah");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn test_phrase_lookup_is_slug_insensitive() {
        let presets = Presets::builtin();
        let a = presets.phrase("Rah Voh Lah").unwrap();
        let b = presets.phrase("rah-voh-lah").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_phrase_falls_back_to_band() {
        let presets = Presets::builtin();
        let low = presets.resolve("No Such Phrase", 53.8);
        let high = presets.resolve("No Such Phrase", 300.0);
        assert_eq!(low.reverb_weight, 0.80);
        assert_eq!(high.reverb_weight, 0.40);
    }

    #[test]
    fn test_band_table_covers_all_frequencies() {
        let presets = Presets::builtin();
        for freq in [1.0, 88.9, 89.0, 143.9, 233.0, 1e6] {
            let p = presets.band(freq);
            assert!(p.reverb_weight > 0.0);
            assert!(p.delay_seconds > 0.0);
        }
    }

    #[test]
    fn test_toml_override() {
        let toml = r#"
            default = { reverb_weight = 0.5, delay_seconds = 0.3 }

            [phrases]
            "custom-tone" = { reverb_weight = 0.9, delay_seconds = 0.8 }

            [[bands]]
            upper_hz = 100.0
            reverb_weight = 0.7
            delay_seconds = 0.6

            [[bands]]
            upper_hz = inf
            reverb_weight = 0.3
            delay_seconds = 0.2
        "#;
        let presets = Presets::from_toml_str(toml).unwrap();
        assert!(presets.phrase("Custom Tone").is_some());
        assert_eq!(presets.band(50.0).reverb_weight, 0.7);
        assert_eq!(presets.band(500.0).reverb_weight, 0.3);
    }

    #[test]
    fn test_empty_band_table_rejected() {
        let toml = r#"
            default = { reverb_weight = 0.5, delay_seconds = 0.3 }
            bands = []
            [phrases]
        "#;
        assert!(Presets::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_max_reverb_weight() {
        let presets = Presets::builtin();
        assert!((presets.max_reverb_weight() - 0.95).abs() < 1e-9);
    }
}
