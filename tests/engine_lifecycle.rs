//! End-to-end lifecycle tests driven through the public engine API with
//! a deterministic output double.

use pneuma::breath::BREATH_PERIOD;
use pneuma::engine::{
    EngineOptions, ToneEngine, STOP_FADE_SECS, TEARDOWN_GRACE_SECS,
};
use pneuma::harmonics::QualityTier;
use pneuma::output::ManualOutput;
use pneuma::sources::{CancelToken, ClockSource, ImpulseResponseProvider, BUFFER_CACHE_CAPACITY};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// Low rate keeps multi-breath renders cheap while exercising the same code.
const SR: f32 = 8_000.0;

struct ZeroClock;
impl ClockSource for ZeroClock {
    fn fetch(&self) -> Result<f64, String> {
        Ok(0.0)
    }
}

struct TinyIr {
    fetches: Arc<AtomicUsize>,
}
impl ImpulseResponseProvider for TinyIr {
    fn fetch(&self, _slug: &str, _cancel: &CancelToken) -> Result<Arc<Vec<f32>>, String> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        // A short decaying tail.
        Ok(Arc::new(
            (0..64).map(|i| 0.5 * 0.9f32.powi(i)).collect::<Vec<f32>>(),
        ))
    }
}

struct FailingIr;
impl ImpulseResponseProvider for FailingIr {
    fn fetch(&self, slug: &str, _cancel: &CancelToken) -> Result<Arc<Vec<f32>>, String> {
        Err(format!("impulse '{}' unreachable", slug))
    }
}

fn options() -> EngineOptions {
    EngineOptions {
        quality: QualityTier::Low,
        spawn_control_thread: false,
        resync: false,
        ..EngineOptions::default()
    }
}

fn engine_with(output: ManualOutput, opts: EngineOptions) -> ToneEngine {
    ToneEngine::new(Box::new(output), 53.8, "Rah Voh Lah", opts).with_clock(Arc::new(ZeroClock))
}

fn drain_stop(handle: &ManualOutput) {
    let frames = ((STOP_FADE_SECS + TEARDOWN_GRACE_SECS + 0.1) * SR as f64) as usize;
    handle.advance(frames);
}

fn settle(engine: &mut ToneEngine) {
    for _ in 0..50 {
        engine.control_tick();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[test]
fn test_ten_rapid_cycles_leak_nothing() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let output = ManualOutput::new(SR);
    let handle = output.clone();
    let mut engine = engine_with(output, options()).with_impulse_provider(Arc::new(TinyIr {
        fetches: Arc::clone(&fetches),
    }));

    for cycle in 0..10 {
        engine.play().unwrap();
        assert!(engine.is_running(), "cycle {} must be running", cycle);
        handle.advance(256);
        settle(&mut engine);
        engine.stop();
        assert!(!engine.is_running());
        drain_stop(&handle);
        assert_eq!(engine.node_count(), 0, "cycle {} leaked nodes", cycle);
        assert_eq!(engine.active_timers(), 0, "cycle {} leaked timers", cycle);
        assert!(engine.ir_cache_len() <= BUFFER_CACHE_CAPACITY);
    }

    // One phrase, so the cache absorbs almost every cycle; without it
    // this would be 10.
    assert!(fetches.load(Ordering::Relaxed) <= 2);

    drop(engine);
    assert_eq!(
        handle.started.load(Ordering::Relaxed),
        handle.closed.load(Ordering::Relaxed)
    );
}

#[test]
fn test_ir_failure_leaves_dry_path_audible() {
    let output = ManualOutput::new(SR);
    let handle = output.clone();
    let mut engine = engine_with(output, options()).with_impulse_provider(Arc::new(FailingIr));
    engine.play().unwrap();
    settle(&mut engine);

    // Past breath alignment plus fade-in.
    handle.advance((2.0 * SR) as usize);
    let (left, right) = handle.advance(SR as usize);
    let peak = left
        .iter()
        .chain(&right)
        .map(|s| s.abs())
        .fold(0.0_f32, f32::max);
    assert!(peak > 1e-3, "dry signal must continue without an impulse");

    // Stop must still fade smoothly toward silence.
    engine.stop();
    let (left, _) = handle.advance((STOP_FADE_SECS * SR as f64) as usize);
    let head = left[..128].iter().map(|s| s.abs()).fold(0.0_f32, f32::max);
    let tail = left[left.len() - 128..]
        .iter()
        .map(|s| s.abs())
        .fold(0.0_f32, f32::max);
    assert!(tail < head, "stop fade must decay");
    drain_stop(&handle);
    assert_eq!(engine.node_count(), 0);
}

#[test]
fn test_output_stays_under_full_scale() {
    let output = ManualOutput::new(SR);
    let handle = output.clone();
    let mut engine = engine_with(output, options()).with_impulse_provider(Arc::new(TinyIr {
        fetches: Arc::new(AtomicUsize::new(0)),
    }));
    engine.play().unwrap();
    settle(&mut engine);
    engine.set_reverb_mix(1.0); // clamps to the cap, worst case wet

    let mut peak = 0.0_f32;
    for _ in 0..8 {
        let (left, right) = handle.advance(SR as usize);
        engine.control_tick();
        for s in left.iter().chain(&right) {
            peak = peak.max(s.abs());
        }
    }
    assert!(peak <= 1.0, "limiter must hold the bus at or under 1.0, got {}", peak);
    assert!(peak > 0.0);
}

#[test]
fn test_breath_phase_progresses_over_a_cycle() {
    let output = ManualOutput::new(SR);
    let handle = output.clone();
    let mut engine = engine_with(output, options());
    engine.play().unwrap();

    let quarter = (BREATH_PERIOD * SR as f64 / 4.0) as usize;
    handle.advance(quarter);
    let a = engine.breath_phase();
    handle.advance(quarter);
    let b = engine.breath_phase();
    assert!(a > 0.0 && a < 1.0);
    assert!(b > a, "phase must advance within one cycle: {} -> {}", a, b);

    engine.stop();
    drain_stop(&handle);
    assert_eq!(engine.breath_phase(), 0.0, "phase reads zero while idle");
}

#[test]
fn test_scheduler_automation_moves_the_wet_mix() {
    let output = ManualOutput::new(SR);
    let handle = output.clone();
    let mut engine = engine_with(output, options());
    engine.play().unwrap();

    // Cross two breath boundaries, ticking the scheduler as a host would.
    let step = (SR as f64 * 0.5) as usize;
    let mut meters = Vec::new();
    for _ in 0..((BREATH_PERIOD * 2.5 / 0.5) as usize) {
        handle.advance(step);
        engine.control_tick();
        meters.push(engine.meter().rms);
    }
    let moving = meters.windows(2).any(|w| (w[0] - w[1]).abs() > 1e-6);
    assert!(moving, "breath automation must modulate the output");
}
