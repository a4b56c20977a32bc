//! Pneuma CLI - play a breath-synchronized tone from the command line

use clap::{Parser, Subcommand};
use pneuma::engine::{EngineOptions, ToneEngine};
use pneuma::harmonics::QualityTier;
use pneuma::output::CpalOutput;
use pneuma::presets::Presets;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pneuma")]
#[command(about = "Breath-synchronized procedural audio engine", long_about = None)]
struct Cli {
    /// Preset override file (TOML), merged over the built-in tables
    #[arg(short, long, global = true)]
    presets: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a tone on the default output device
    Play {
        /// Base frequency in Hz
        #[arg(short, long, default_value = "53.8")]
        frequency: f64,

        /// Phrase key, e.g. "Rah Voh Lah"
        #[arg(long, default_value = "Rah Voh Lah")]
        phrase: String,

        /// Duration in seconds (0 = until Ctrl-C)
        #[arg(short, long, default_value = "60.0")]
        duration: f64,

        /// Quality tier: low, medium, high
        #[arg(short, long, default_value = "high")]
        quality: String,

        /// Disable the binaural beat layer
        #[arg(long)]
        no_binaural: bool,

        /// Binaural beat rate in Hz
        #[arg(long, default_value = "6.0")]
        beat_hz: f64,

        /// Disable the stereo width delay
        #[arg(long)]
        no_width: bool,

        /// Enable slow spatial drift of the harmonic voices
        #[arg(long)]
        drift: bool,

        /// Disable the periodic silence dips
        #[arg(long)]
        no_silence: bool,

        /// Disable clock resynchronization
        #[arg(long)]
        no_resync: bool,
    },

    /// Print the derived parameters for a frequency/phrase pair
    Derive {
        /// Base frequency in Hz
        #[arg(short, long, default_value = "53.8")]
        frequency: f64,

        /// Phrase key
        #[arg(long, default_value = "Rah Voh Lah")]
        phrase: String,

        /// Clock value in seconds
        #[arg(long, default_value = "0.0")]
        clock: f64,

        /// Breath phase in [0, 1)
        #[arg(long, default_value = "0.0")]
        breath: f64,
    },
}

fn parse_quality(s: &str) -> Result<QualityTier, String> {
    match s.to_ascii_lowercase().as_str() {
        "low" => Ok(QualityTier::Low),
        "medium" | "mid" => Ok(QualityTier::Medium),
        "high" => Ok(QualityTier::High),
        other => Err(format!("unknown quality tier '{}'", other)),
    }
}

fn load_presets(path: &Option<PathBuf>) -> Result<Presets, Box<dyn std::error::Error>> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)?;
            Ok(Presets::from_toml_str(&text)?)
        }
        None => Ok(Presets::builtin()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let presets = load_presets(&cli.presets)?;

    match cli.command {
        Commands::Play {
            frequency,
            phrase,
            duration,
            quality,
            no_binaural,
            beat_hz,
            no_width,
            drift,
            no_silence,
            no_resync,
        } => {
            let options = EngineOptions {
                binaural: !no_binaural,
                beat_hz,
                stereo_width: !no_width,
                spatial_drift: drift,
                periodic_silence: !no_silence,
                resync: !no_resync,
                quality: parse_quality(&quality)?,
                spawn_control_thread: true,
            };

            let output = CpalOutput::new()?;
            let mut engine =
                ToneEngine::new(Box::new(output), frequency, &phrase, options).with_presets(presets);
            engine.play()?;

            let run_for = if duration > 0.0 {
                Duration::from_secs_f64(duration)
            } else {
                // Effectively "until killed".
                Duration::from_secs(u64::MAX / 4)
            };
            std::thread::sleep(run_for);

            engine.stop();
            // Let the fade and teardown drain before the device drops.
            std::thread::sleep(Duration::from_secs_f64(
                pneuma::engine::STOP_FADE_SECS + pneuma::engine::TEARDOWN_GRACE_SECS + 0.1,
            ));
        }
        Commands::Derive {
            frequency,
            phrase,
            clock,
            breath,
        } => {
            let snapshot = pneuma::modulation::ModulationSnapshot {
                frequency_hz: frequency,
                phrase,
                clock_value: clock,
                breath_phase: breath,
            };
            let derived = pneuma::modulation::derive(&snapshot, &presets);
            println!("wet ratio:    {:.4}", derived.wet_ratio);
            println!("delay (secs): {:.4}", derived.delay_seconds);
        }
    }

    Ok(())
}
