//! # Pneuma - Breath-Synchronized Procedural Audio
//!
//! Pneuma is a real-time synthesis and effects engine that breathes: a
//! bank of Fibonacci-spaced harmonics plays through a convolution reverb
//! and feedback delay whose parameters are derived from symbolic inputs
//! (a phrase, a base frequency, an external clock) and modulated on a
//! slow breath cycle.
//!
//! ## Core Features
//!
//! - **Modulation Math**: Reverb wet ratio and delay time derived from
//!   frequency, phrase preset, ambient clock, and breath phase, combined
//!   with golden-ratio weights and a perceptual easing curve
//! - **Harmonic Bank**: Fibonacci overtone/undertone series with
//!   quality-tier shaving and energy-normalized gains
//! - **Audio Graph**: Dry/wet split into convolution reverb plus feedback
//!   delay, smoothed parameter ramps, limiter-protected master bus
//! - **Breath Scheduler**: Per-cycle events (periodic silence dips, clock
//!   resync) plus continuous LFO automation of feedback, wet mix, and
//!   delay time
//! - **Lifecycle Manager**: Click-free play/stop, visibility-aware
//!   fallback, resume retry with backoff, leak-free rapid cycling
//!
//! ## Quick Start
//!
//! ```no_run
//! use pneuma::engine::{EngineOptions, ToneEngine};
//! use pneuma::output::CpalOutput;
//!
//! let output = CpalOutput::new().expect("no audio device");
//! let mut engine = ToneEngine::new(
//!     Box::new(output),
//!     53.8,
//!     "Rah Voh Lah",
//!     EngineOptions::default(),
//! );
//! engine.play().expect("engine start");
//! std::thread::sleep(std::time::Duration::from_secs(30));
//! engine.stop();
//! ```

pub mod breath;
pub mod cache;
pub mod engine;
pub mod graph;
pub mod harmonics;
pub mod modulation;
pub mod output;
pub mod param;
pub mod presets;
pub mod scheduler;
pub mod sources;
