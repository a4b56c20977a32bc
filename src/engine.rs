//! Engine lifecycle and public facade
//!
//! `ToneEngine` owns the whole session: output device, audio graph,
//! breath scheduler, fetchers, and the control loop that drives them. It
//! guarantees the teardown ordering the graph needs (fade to silence
//! first, node disposal at a scheduled audio-clock time after it, device
//! release last) and keeps `play()`/`stop()` idempotent, so rapid cycles
//! and visibility flips never leak oscillators, threads, or listeners.

use crate::breath::BREATH_PERIOD;
use crate::graph::{AudioGraph, GraphOptions, Meter, NodeCounter};
use crate::harmonics::{build_harmonics, QualityTier};
use crate::modulation::{self, ModulationSnapshot, WET_CAP, WET_FLOOR};
use crate::output::AudioOutput;
use crate::presets::{slugify, Presets};
use crate::scheduler::{BreathScheduler, SchedulerState, FEEDBACK_BASE};
use crate::sources::{
    BufferFetcher, ClockSource, ImpulseResponseProvider, LocalClock, RenderedFallbackProvider,
    BUFFER_CACHE_CAPACITY,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stop ramps every gain to zero over this window before any disposal.
pub const STOP_FADE_SECS: f64 = 0.4;

/// Node disposal happens this long after the fade has completed.
pub const TEARDOWN_GRACE_SECS: f64 = 0.15;

/// Cross-fade used for visibility transitions and the fallback layer.
pub const VISIBILITY_FADE_SECS: f64 = 0.6;

/// Ramp for user-facing parameter changes.
const USER_RAMP_SECS: f32 = 0.12;

/// Control loop cadence.
const CONTROL_TICK_MS: u64 = 10;

/// Resume retry backoff, in control ticks (~10 ms each), capped.
const RESUME_BACKOFF_START_TICKS: u64 = 25;
const RESUME_BACKOFF_MAX_TICKS: u64 = 800;

/// Page/host visibility, consumed as a plain input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Platform wake-lock seam. Absence is not an error: the engine falls
/// back to a keepalive tick.
pub trait WakeLock: Send {
    /// Returns false when the platform has no wake lock to give.
    fn acquire(&mut self) -> bool;
    fn release(&mut self);
}

/// Default wake lock: none available, keepalive fallback engages.
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&mut self) -> bool {
        false
    }
    fn release(&mut self) {}
}

/// Plays the pre-rendered fallback layer while the host is backgrounded.
pub trait FallbackPlayer: Send {
    fn start(&mut self, buffer: Option<Arc<Vec<f32>>>, fade_secs: f64);
    fn stop(&mut self, fade_secs: f64);
    fn is_active(&self) -> bool;
}

/// Default fallback player: silence, with a log line.
pub struct NullFallbackPlayer {
    active: bool,
}

impl NullFallbackPlayer {
    pub fn new() -> Self {
        Self { active: false }
    }
}

impl Default for NullFallbackPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackPlayer for NullFallbackPlayer {
    fn start(&mut self, buffer: Option<Arc<Vec<f32>>>, _fade_secs: f64) {
        if buffer.is_none() {
            warn!("no rendered fallback available, backgrounded output is silent");
        }
        self.active = true;
    }
    fn stop(&mut self, _fade_secs: f64) {
        self.active = false;
    }
    fn is_active(&self) -> bool {
        self.active
    }
}

/// Independent on/off switches for the optional enhancement layers, plus
/// the explicit quality tier. Each flag gates only its own contribution
/// to the signal graph.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub binaural: bool,
    pub beat_hz: f64,
    pub stereo_width: bool,
    pub spatial_drift: bool,
    pub periodic_silence: bool,
    pub resync: bool,
    pub quality: QualityTier,
    /// Spawn the background control loop on `play()`. Hosts that drive
    /// [`ToneEngine::control_tick`] themselves can turn this off.
    pub spawn_control_thread: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            binaural: true,
            beat_hz: 6.0,
            stereo_width: true,
            spatial_drift: false,
            periodic_silence: true,
            resync: true,
            quality: QualityTier::High,
            spawn_control_thread: true,
        }
    }
}

/// Everything the render callback and the control loop share.
struct Shared {
    graph: Option<AudioGraph>,
    scheduler: BreathScheduler,
    frames: u64,
    sample_rate: f32,
    /// Frame index at which node disposal is due, scheduled by `stop()`.
    teardown_at: Option<u64>,
    ir_fetcher: BufferFetcher,
    fallback_fetcher: BufferFetcher,
    fallback_buffer: Option<Arc<Vec<f32>>>,
    current_slug: String,
}

impl Shared {
    fn now(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Running,
}

struct ControlLoop {
    run: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// The public engine facade.
pub struct ToneEngine {
    options: EngineOptions,
    presets: Presets,
    frequency_hz: f64,
    phrase: String,
    output: Arc<Mutex<Box<dyn AudioOutput>>>,
    clock: Arc<dyn ClockSource>,
    ir_provider: Option<Arc<dyn ImpulseResponseProvider>>,
    fallback_provider: Option<Arc<dyn RenderedFallbackProvider>>,
    fallback_player: Box<dyn FallbackPlayer>,
    wake_lock: Box<dyn WakeLock>,
    wake_held: Arc<AtomicBool>,
    keepalive_ticks: Arc<AtomicU64>,
    shared: Arc<Mutex<Shared>>,
    state: EngineState,
    backgrounded: bool,
    last_clock: f64,
    user_wet: Option<f64>,
    control: Option<ControlLoop>,
    timers: Arc<AtomicUsize>,
    node_counter: NodeCounter,
    ticks_seen: u64,
    resume_interval: u64,
    next_resume_tick: u64,
}

impl ToneEngine {
    pub fn new(
        output: Box<dyn AudioOutput>,
        frequency_hz: f64,
        phrase: &str,
        options: EngineOptions,
    ) -> Self {
        let shared = Shared {
            graph: None,
            scheduler: BreathScheduler::new(options.periodic_silence, options.resync),
            frames: 0,
            sample_rate: output.sample_rate(),
            teardown_at: None,
            ir_fetcher: BufferFetcher::new(BUFFER_CACHE_CAPACITY),
            fallback_fetcher: BufferFetcher::new(BUFFER_CACHE_CAPACITY),
            fallback_buffer: None,
            current_slug: slugify(phrase),
        };
        Self {
            options,
            presets: Presets::builtin(),
            frequency_hz,
            phrase: phrase.to_string(),
            output: Arc::new(Mutex::new(output)),
            clock: Arc::new(LocalClock::new()),
            ir_provider: None,
            fallback_provider: None,
            fallback_player: Box::new(NullFallbackPlayer::new()),
            wake_lock: Box::new(NoWakeLock),
            wake_held: Arc::new(AtomicBool::new(false)),
            keepalive_ticks: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(Mutex::new(shared)),
            state: EngineState::Idle,
            backgrounded: false,
            last_clock: 0.0,
            user_wet: None,
            control: None,
            timers: Arc::new(AtomicUsize::new(0)),
            node_counter: NodeCounter::new(),
            ticks_seen: 0,
            resume_interval: RESUME_BACKOFF_START_TICKS,
            next_resume_tick: 0,
        }
    }

    pub fn with_presets(mut self, presets: Presets) -> Self {
        self.presets = presets;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_impulse_provider(mut self, provider: Arc<dyn ImpulseResponseProvider>) -> Self {
        self.ir_provider = Some(provider);
        self
    }

    pub fn with_fallback_provider(mut self, provider: Arc<dyn RenderedFallbackProvider>) -> Self {
        self.fallback_provider = Some(provider);
        self
    }

    pub fn with_fallback_player(mut self, player: Box<dyn FallbackPlayer>) -> Self {
        self.fallback_player = player;
        self
    }

    pub fn with_wake_lock(mut self, wake_lock: Box<dyn WakeLock>) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    /// Live node handles attributable to this engine.
    pub fn node_count(&self) -> usize {
        self.node_counter.count()
    }

    /// Background threads currently alive on behalf of this engine.
    pub fn active_timers(&self) -> usize {
        self.timers.load(Ordering::Relaxed)
    }

    pub fn keepalive_ticks(&self) -> u64 {
        self.keepalive_ticks.load(Ordering::Relaxed)
    }

    pub fn ir_cache_len(&self) -> usize {
        self.shared.lock().map(|s| s.ir_fetcher.cache_len()).unwrap_or(0)
    }

    pub fn meter(&self) -> Meter {
        self.shared
            .lock()
            .ok()
            .and_then(|s| s.graph.as_ref().map(|g| g.meter()))
            .unwrap_or_default()
    }

    /// Breath phase in [0, 1), for visual/voice collaborators. Zero while
    /// idle.
    pub fn breath_phase(&self) -> f64 {
        let Ok(sh) = self.shared.lock() else {
            return 0.0;
        };
        if sh.scheduler.state() == SchedulerState::Running {
            sh.scheduler.timeline().phase(sh.now())
        } else {
            0.0
        }
    }

    /// Change the base frequency. Takes effect on the next `play()`.
    pub fn set_frequency(&mut self, frequency_hz: f64) {
        self.frequency_hz = frequency_hz;
        if self.state == EngineState::Running {
            debug!("frequency change while running applies on next play()");
        }
    }

    /// Start playing. A no-op while already running.
    pub fn play(&mut self) -> Result<(), String> {
        if self.state == EngineState::Running {
            debug!("play() while running is a no-op");
            return Ok(());
        }

        // Dispose any prior device before creating the session.
        if let Ok(mut out) = self.output.lock() {
            out.close();
        }

        self.wake_held
            .store(self.wake_lock.acquire(), Ordering::Relaxed);
        if !self.wake_held.load(Ordering::Relaxed) {
            info!("wake lock unavailable, keepalive fallback engaged");
        }

        match self.clock.fetch() {
            Ok(v) => self.last_clock = v,
            Err(e) => warn!(
                "clock fetch failed, keeping last value {:.3}: {}",
                self.last_clock, e
            ),
        }

        // Defer the first audible sample to the next breath boundary of
        // the external clock.
        let offset = self.last_clock.rem_euclid(BREATH_PERIOD);
        let wait = if offset < 1e-9 {
            0.0
        } else {
            BREATH_PERIOD - offset
        };

        let snapshot = ModulationSnapshot {
            frequency_hz: self.frequency_hz,
            phrase: self.phrase.clone(),
            clock_value: self.last_clock,
            breath_phase: 0.0,
        };
        let derivation = modulation::derive(&snapshot, &self.presets);
        let wet = self.user_wet.unwrap_or(derivation.wet_ratio);

        let sample_rate = self
            .output
            .lock()
            .map_err(|_| "output poisoned".to_string())?
            .sample_rate();

        self.install_graph(sample_rate, wet, derivation.delay_seconds, wait, true)?;

        let render = self.make_render();
        self.output
            .lock()
            .map_err(|_| "output poisoned".to_string())?
            .start(render)?;

        self.ticks_seen = 0;
        self.resume_interval = RESUME_BACKOFF_START_TICKS;
        self.next_resume_tick = 0;
        if self.options.spawn_control_thread {
            self.spawn_control_loop();
        }
        self.state = EngineState::Running;
        self.backgrounded = false;
        info!(
            "playing {:.1} Hz '{}' (wet {:.3}, delay {:.3}s, first sound in {:.2}s)",
            self.frequency_hz, self.phrase, wet, derivation.delay_seconds, wait
        );
        Ok(())
    }

    /// Stop playing. A no-op while idle. Fades to silence first, then
    /// schedules node disposal, in that order; the device handle itself
    /// is released on the next `play()` or on drop, after the fade has
    /// drained.
    pub fn stop(&mut self) {
        if self.state == EngineState::Idle {
            debug!("stop() while idle is a no-op");
            return;
        }

        self.wake_lock.release();
        self.wake_held.store(false, Ordering::Relaxed);
        if self.fallback_player.is_active() {
            self.fallback_player.stop(VISIBILITY_FADE_SECS);
        }
        self.stop_control_loop();

        if let Ok(mut sh) = self.shared.lock() {
            sh.ir_fetcher.abort();
            sh.fallback_fetcher.abort();
            sh.scheduler.stop();
            if let Some(graph) = &mut sh.graph {
                graph.fade_out(STOP_FADE_SECS as f32);
            }
            let grace = ((STOP_FADE_SECS + TEARDOWN_GRACE_SECS) * sh.sample_rate as f64) as u64;
            sh.teardown_at = Some(sh.frames + grace);
        }

        self.state = EngineState::Idle;
        self.backgrounded = false;
        info!("stopping, fade {}s + grace {}s", STOP_FADE_SECS, TEARDOWN_GRACE_SECS);
    }

    /// Clamp into `[WET_FLOOR, WET_CAP]` and apply with a smooth ramp.
    /// The value becomes the scheduler's wet baseline.
    pub fn set_reverb_mix(&mut self, ratio: f64) {
        let wet = ratio.clamp(WET_FLOOR, WET_CAP);
        self.user_wet = Some(wet);
        if let Ok(mut sh) = self.shared.lock() {
            sh.scheduler.set_wet_baseline(wet);
            if let Some(graph) = &mut sh.graph {
                graph.set_mix_target(wet as f32, USER_RAMP_SECS, 0.0);
            }
        }
    }

    /// Switch the phrase: retargets wet/delay and swaps the impulse
    /// response live, superseding any in-flight fetch for the old phrase.
    pub fn set_phrase(&mut self, phrase: &str) {
        self.phrase = phrase.to_string();
        let slug = slugify(phrase);
        let Ok(mut sh) = self.shared.lock() else {
            return;
        };
        sh.current_slug = slug.clone();
        if self.state != EngineState::Running {
            return;
        }

        let phase = sh.scheduler.timeline().phase(sh.now());
        let snapshot = ModulationSnapshot {
            frequency_hz: self.frequency_hz,
            phrase: self.phrase.clone(),
            clock_value: self.last_clock,
            breath_phase: phase,
        };
        let derivation = modulation::derive(&snapshot, &self.presets);
        let wet = self.user_wet.unwrap_or(derivation.wet_ratio);
        sh.scheduler.set_wet_baseline(wet);
        sh.scheduler.set_delay_base(derivation.delay_seconds);
        if let Some(graph) = &mut sh.graph {
            graph.set_mix_target(wet as f32, USER_RAMP_SECS, 0.0);
            graph.set_delay_time_target(derivation.delay_seconds as f32, USER_RAMP_SECS, 0.0);
        }

        if let Some(cached) = sh.ir_fetcher.cached(&slug) {
            if let Some(graph) = &mut sh.graph {
                graph.swap_impulse(Some(cached));
            }
        } else if let Some(provider) = self.ir_provider.clone() {
            sh.ir_fetcher.abort();
            let fetch_slug = slug.clone();
            sh.ir_fetcher
                .request(&slug, move |cancel| provider.fetch(&fetch_slug, &cancel));
        }
        drop(sh);
        self.request_fallback();
    }

    /// Visibility input from the host. Hidden while running swaps the
    /// live graph for the rendered fallback layer; visible swaps back.
    pub fn set_visibility(&mut self, visibility: Visibility) {
        match visibility {
            Visibility::Hidden => {
                if self.state != EngineState::Running || self.backgrounded {
                    return;
                }
                self.backgrounded = true;
                let buffer = self
                    .shared
                    .lock()
                    .ok()
                    .and_then(|sh| sh.fallback_buffer.clone());
                self.fallback_player.start(buffer, VISIBILITY_FADE_SECS);
                if let Ok(mut sh) = self.shared.lock() {
                    if let Some(graph) = &mut sh.graph {
                        graph.fade_out(VISIBILITY_FADE_SECS as f32);
                    }
                    let grace =
                        ((VISIBILITY_FADE_SECS + TEARDOWN_GRACE_SECS) * sh.sample_rate as f64) as u64;
                    sh.teardown_at = Some(sh.frames + grace);
                }
                info!("backgrounded, fallback layer engaged");
            }
            Visibility::Visible => {
                self.notify_user_gesture();
                if self.state != EngineState::Running || !self.backgrounded {
                    return;
                }
                self.backgrounded = false;
                self.fallback_player.stop(VISIBILITY_FADE_SECS);
                if let Err(e) = self.rebuild_live_graph() {
                    warn!("could not resume live graph: {}", e);
                }
                info!("foregrounded, live graph resumed");
            }
        }
    }

    /// A user gesture re-kicks the resume retry immediately.
    pub fn notify_user_gesture(&mut self) {
        self.resume_interval = RESUME_BACKOFF_START_TICKS;
        self.next_resume_tick = 0;
        if self.state == EngineState::Running {
            if let Ok(mut out) = self.output.lock() {
                if !out.is_running() {
                    if let Err(e) = out.resume() {
                        debug!("gesture resume attempt failed: {}", e);
                    }
                }
            }
        }
    }

    /// One housekeeping tick: scheduler advance, fetch polling, teardown
    /// bookkeeping, resume retry. Called from the control loop; hosts
    /// that disable the loop call it themselves.
    pub fn control_tick(&mut self) {
        self.ticks_seen += 1;
        control_tick_inner(&self.shared);
        if self.state == EngineState::Running && !self.wake_held.load(Ordering::Relaxed) {
            self.keepalive_ticks.fetch_add(1, Ordering::Relaxed);
        }
        if self.state == EngineState::Running && self.ticks_seen >= self.next_resume_tick {
            let mut suspended = false;
            if let Ok(mut out) = self.output.lock() {
                if !out.is_running() {
                    suspended = true;
                    if out.resume().is_ok() {
                        self.resume_interval = RESUME_BACKOFF_START_TICKS;
                        suspended = false;
                        info!("output resumed");
                    }
                }
            }
            if suspended {
                self.next_resume_tick = self.ticks_seen + self.resume_interval;
                self.resume_interval = (self.resume_interval * 2).min(RESUME_BACKOFF_MAX_TICKS);
            }
        }
    }

    fn request_fallback(&mut self) {
        let Some(provider) = self.fallback_provider.clone() else {
            return;
        };
        let slug = slugify(&self.phrase);
        let key = format!("{:.3}:{}", self.frequency_hz, slug);
        let frequency = self.frequency_hz;
        if let Ok(mut sh) = self.shared.lock() {
            if let Some(cached) = sh.fallback_fetcher.cached(&key) {
                sh.fallback_buffer = Some(cached);
            } else {
                sh.fallback_fetcher
                    .request(&key, move |cancel| provider.fetch(frequency, &slug, &cancel));
            }
        }
    }

    /// Build a fresh graph and hand it to the render path. `reset_clock`
    /// restarts the audio-clock epoch and the breath anchor (a new
    /// session); a rebuild after backgrounding keeps both.
    fn install_graph(
        &mut self,
        sample_rate: f32,
        wet: f64,
        delay_seconds: f64,
        start_delay: f64,
        reset_clock: bool,
    ) -> Result<(), String> {
        let entries = build_harmonics(self.frequency_hz, self.options.quality, sample_rate)?;
        let graph_options = GraphOptions {
            binaural: self.options.binaural,
            beat_hz: self.options.beat_hz,
            stereo_width: self.options.stereo_width,
            spatial_drift: self.options.spatial_drift,
        };
        let slug = slugify(&self.phrase);

        let mut sh = self.shared.lock().map_err(|_| "engine poisoned".to_string())?;
        let ir = sh.ir_fetcher.cached(&slug);
        if ir.is_none() {
            if let Some(provider) = self.ir_provider.clone() {
                let fetch_slug = slug.clone();
                sh.ir_fetcher
                    .request(&slug, move |cancel| provider.fetch(&fetch_slug, &cancel));
            }
        }
        let graph = AudioGraph::build(
            &entries,
            wet,
            delay_seconds,
            FEEDBACK_BASE as f32,
            ir,
            &graph_options,
            sample_rate,
            start_delay,
            &self.node_counter,
        )?;

        if reset_clock {
            sh.frames = 0;
            sh.sample_rate = sample_rate;
            sh.scheduler.set_clock(Arc::clone(&self.clock));
            sh.scheduler
                .start(start_delay, wet, delay_seconds, self.last_clock);
        }
        sh.teardown_at = None;
        sh.current_slug = slug;
        sh.graph = Some(graph);
        drop(sh);

        self.request_fallback();
        Ok(())
    }

    /// Rebuild the live graph after backgrounding, aligned to the next
    /// breath boundary of the still-running timeline.
    fn rebuild_live_graph(&mut self) -> Result<(), String> {
        let (sample_rate, wait, wet, delay_base) = {
            let sh = self.shared.lock().map_err(|_| "engine poisoned".to_string())?;
            let now = sh.now();
            let timeline = sh.scheduler.timeline();
            let next = timeline.boundary_time(timeline.cycle_index(now) + 1);
            let snapshot = ModulationSnapshot {
                frequency_hz: self.frequency_hz,
                phrase: self.phrase.clone(),
                clock_value: self.last_clock,
                breath_phase: timeline.phase(now),
            };
            let derivation = modulation::derive(&snapshot, &self.presets);
            let wet = self.user_wet.unwrap_or(derivation.wet_ratio);
            (sh.sample_rate, (next - now).max(0.0), wet, derivation.delay_seconds)
        };
        self.install_graph(sample_rate, wet, delay_base, wait, false)
    }

    fn make_render(&self) -> crate::output::RenderFn {
        let shared = Arc::clone(&self.shared);
        Box::new(move |left: &mut [f32], right: &mut [f32]| {
            let Ok(mut sh) = shared.lock() else {
                left.fill(0.0);
                right.fill(0.0);
                return;
            };
            for i in 0..left.len() {
                let (l, r) = match &mut sh.graph {
                    Some(graph) => graph.process_frame(),
                    None => (0.0, 0.0),
                };
                left[i] = l;
                right[i] = r;
                sh.frames += 1;
                if let Some(due) = sh.teardown_at {
                    // Disposal happens at the scheduled audio-clock time,
                    // never before the fade has drained.
                    if sh.frames >= due {
                        sh.graph = None;
                        sh.teardown_at = None;
                    }
                }
            }
        })
    }

    fn spawn_control_loop(&mut self) {
        let run = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let output = Arc::clone(&self.output);
        let wake_held = Arc::clone(&self.wake_held);
        let keepalive = Arc::clone(&self.keepalive_ticks);
        let timers = Arc::clone(&self.timers);
        timers.fetch_add(1, Ordering::Relaxed);
        let run_flag = Arc::clone(&run);
        let handle = thread::spawn(move || {
            let mut tick = 0u64;
            let mut interval = RESUME_BACKOFF_START_TICKS;
            let mut next_resume = 0u64;
            while run_flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(CONTROL_TICK_MS));
                tick += 1;
                control_tick_inner(&shared);
                if !wake_held.load(Ordering::Relaxed) {
                    keepalive.fetch_add(1, Ordering::Relaxed);
                }
                if tick >= next_resume {
                    let mut suspended = false;
                    if let Ok(mut out) = output.lock() {
                        if !out.is_running() {
                            suspended = out.resume().is_err();
                        }
                    }
                    if suspended {
                        next_resume = tick + interval;
                        interval = (interval * 2).min(RESUME_BACKOFF_MAX_TICKS);
                    } else {
                        interval = RESUME_BACKOFF_START_TICKS;
                    }
                }
            }
            timers.fetch_sub(1, Ordering::Relaxed);
        });
        self.control = Some(ControlLoop { run, handle });
    }

    fn stop_control_loop(&mut self) {
        if let Some(control) = self.control.take() {
            control.run.store(false, Ordering::Relaxed);
            if control.handle.join().is_err() {
                warn!("control loop panicked during shutdown");
            }
        }
    }
}

/// Scheduler advance and fetch polling, shared between the background
/// loop and host-driven ticking.
fn control_tick_inner(shared: &Arc<Mutex<Shared>>) {
    let Ok(mut sh) = shared.lock() else {
        return;
    };
    let now = sh.now();
    let sh = &mut *sh;
    if let Some(graph) = &mut sh.graph {
        sh.scheduler.advance(now, graph);
    }
    if let Some(done) = sh.ir_fetcher.poll() {
        if done.key == sh.current_slug {
            match done.result {
                Ok(buffer) => {
                    if let Some(graph) = &mut sh.graph {
                        graph.swap_impulse(Some(buffer));
                        info!("impulse response '{}' installed", done.key);
                    }
                }
                Err(e) => warn!("impulse response '{}' unavailable: {}", done.key, e),
            }
        }
    }
    if let Some(done) = sh.fallback_fetcher.poll() {
        if let Ok(buffer) = done.result {
            sh.fallback_buffer = Some(buffer);
        }
    }
}

impl Drop for ToneEngine {
    fn drop(&mut self) {
        self.stop_control_loop();
        if let Ok(mut sh) = self.shared.lock() {
            sh.scheduler.stop();
            sh.ir_fetcher.abort();
            sh.fallback_fetcher.abort();
            sh.graph = None;
        }
        if let Ok(mut out) = self.output.lock() {
            out.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ManualOutput;
    use crate::sources::CancelToken;

    const SR: f32 = 48_000.0;

    struct ZeroClock;
    impl ClockSource for ZeroClock {
        fn fetch(&self) -> Result<f64, String> {
            Ok(0.0)
        }
    }

    fn quiet_engine(output: ManualOutput) -> ToneEngine {
        let options = EngineOptions {
            spawn_control_thread: false,
            resync: false,
            ..EngineOptions::default()
        };
        ToneEngine::new(Box::new(output), 53.8, "Rah Voh Lah", options)
            .with_clock(Arc::new(ZeroClock))
    }

    #[test]
    fn test_play_is_idempotent() {
        let output = ManualOutput::new(SR);
        let handle = output.clone();
        let mut engine = quiet_engine(output);
        engine.play().unwrap();
        let nodes = engine.node_count();
        engine.play().unwrap();
        assert_eq!(engine.node_count(), nodes, "no duplicate graph");
        assert_eq!(handle.started.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let output = ManualOutput::new(SR);
        let mut engine = quiet_engine(output);
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.node_count(), 0);
    }

    #[test]
    fn test_teardown_completes_after_fade_and_grace() {
        let output = ManualOutput::new(SR);
        let handle = output.clone();
        let mut engine = quiet_engine(output);
        engine.play().unwrap();
        assert!(engine.node_count() > 0);
        engine.stop();
        // Nodes must survive the fade window.
        handle.advance((STOP_FADE_SECS * SR as f64 * 0.5) as usize);
        assert!(engine.node_count() > 0, "disposal must wait for the fade");
        // Past fade + grace, everything is gone.
        handle.advance(((STOP_FADE_SECS + TEARDOWN_GRACE_SECS) * SR as f64) as usize + 16);
        assert_eq!(engine.node_count(), 0);
        assert_eq!(engine.active_timers(), 0);
    }

    #[test]
    fn test_stop_fade_is_gradual_not_abrupt() {
        let output = ManualOutput::new(SR);
        let handle = output.clone();
        let mut engine = quiet_engine(output);
        engine.play().unwrap();
        // Get past breath alignment and fade-in (anchor 0, fade 1.5s).
        handle.advance((2.5 * SR) as usize);
        engine.stop();
        let (left, _) = handle.advance((STOP_FADE_SECS * SR as f64) as usize);
        let head: f32 = left[..256].iter().map(|s| s.abs()).fold(0.0, f32::max);
        let tail: f32 = left[left.len() - 256..]
            .iter()
            .map(|s| s.abs())
            .fold(0.0, f32::max);
        assert!(head > 0.0, "sound should still be present at fade start");
        assert!(tail < head, "fade must decay toward silence");
    }

    #[test]
    fn test_rapid_cycles_leak_nothing() {
        let output = ManualOutput::new(SR);
        let handle = output.clone();
        let mut engine = quiet_engine(output);
        let mut last_cache = 0;
        for _ in 0..10 {
            engine.play().unwrap();
            handle.advance(512);
            engine.stop();
            handle.advance(SR as usize); // drain fade + grace
            let cache = engine.ir_cache_len();
            assert!(cache >= last_cache, "cache must be non-decreasing");
            assert!(cache <= BUFFER_CACHE_CAPACITY, "cache must stay bounded");
            last_cache = cache;
            assert_eq!(engine.active_timers(), 0);
            assert_eq!(engine.node_count(), 0);
        }
        drop(engine);
        assert_eq!(
            handle.started.load(Ordering::Relaxed),
            handle.closed.load(Ordering::Relaxed),
            "every device start needs a matching close"
        );
    }

    #[test]
    fn test_ir_failure_still_produces_dry_output() {
        struct FailingIr;
        impl ImpulseResponseProvider for FailingIr {
            fn fetch(&self, _slug: &str, _cancel: &CancelToken) -> Result<Arc<Vec<f32>>, String> {
                Err("http 500".to_string())
            }
        }
        let output = ManualOutput::new(SR);
        let handle = output.clone();
        let mut engine = quiet_engine(output).with_impulse_provider(Arc::new(FailingIr));
        engine.play().unwrap();
        for _ in 0..20 {
            engine.control_tick();
        }
        let (left, right) = handle.advance((3.0 * SR) as usize);
        let rms: f32 = left
            .iter()
            .zip(&right)
            .map(|(l, r)| 0.5 * (l * l + r * r))
            .sum::<f32>()
            / left.len() as f32;
        assert!(rms.sqrt() > 1e-4, "dry path must stay audible without an IR");
        engine.stop();
        handle.advance(SR as usize);
        assert_eq!(engine.node_count(), 0, "stop must still tear down cleanly");
    }

    #[test]
    fn test_set_reverb_mix_clamps_to_cap() {
        let output = ManualOutput::new(SR);
        let handle = output.clone();
        let mut engine = quiet_engine(output);
        engine.play().unwrap();
        engine.set_reverb_mix(3.0);
        handle.advance(SR as usize);
        let wet = engine
            .shared
            .lock()
            .unwrap()
            .graph
            .as_ref()
            .unwrap()
            .wet_gain_value();
        assert!((wet as f64 - WET_CAP).abs() < 1e-3);
    }

    #[test]
    fn test_set_phrase_swaps_impulse_live() {
        struct SmallIr;
        impl ImpulseResponseProvider for SmallIr {
            fn fetch(&self, _slug: &str, _cancel: &CancelToken) -> Result<Arc<Vec<f32>>, String> {
                Ok(Arc::new(vec![0.2; 32]))
            }
        }
        let output = ManualOutput::new(SR);
        let mut engine = quiet_engine(output).with_impulse_provider(Arc::new(SmallIr));
        engine.play().unwrap();
        let started = engine.shared.lock().unwrap().graph.is_some();
        assert!(started);
        engine.set_phrase("Soh Ahm");
        // Let the fetch worker land and the control tick install it.
        for _ in 0..200 {
            engine.control_tick();
            if engine
                .shared
                .lock()
                .unwrap()
                .graph
                .as_ref()
                .map(|g| g.has_impulse())
                .unwrap_or(false)
            {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let sh = engine.shared.lock().unwrap();
        assert!(sh.graph.as_ref().unwrap().has_impulse());
        assert_eq!(sh.current_slug, "soh-ahm");
    }

    #[test]
    fn test_visibility_swaps_to_fallback_and_back() {
        struct RecordingPlayer {
            events: Arc<Mutex<Vec<&'static str>>>,
            active: bool,
        }
        impl FallbackPlayer for RecordingPlayer {
            fn start(&mut self, _buffer: Option<Arc<Vec<f32>>>, _fade: f64) {
                self.events.lock().unwrap().push("start");
                self.active = true;
            }
            fn stop(&mut self, _fade: f64) {
                self.events.lock().unwrap().push("stop");
                self.active = false;
            }
            fn is_active(&self) -> bool {
                self.active
            }
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let player = RecordingPlayer {
            events: Arc::clone(&events),
            active: false,
        };
        let output = ManualOutput::new(SR);
        let handle = output.clone();
        let mut engine = quiet_engine(output).with_fallback_player(Box::new(player));
        engine.play().unwrap();
        handle.advance(1024);

        engine.set_visibility(Visibility::Hidden);
        handle.advance((2.0 * SR) as usize);
        assert_eq!(engine.node_count(), 0, "live graph dropped while hidden");
        engine.set_visibility(Visibility::Visible);
        assert!(engine.node_count() > 0, "live graph rebuilt on return");
        assert_eq!(*events.lock().unwrap(), vec!["start", "stop"]);
        assert!(engine.is_running());
    }

    #[test]
    fn test_resume_backoff_recovers_suspended_output() {
        let output = ManualOutput::new(SR).suspended_for(2);
        let handle = output.clone();
        let mut engine = quiet_engine(output);
        engine.play().unwrap();
        assert!(!handle.is_running());
        // First attempts rejected, later ones succeed with backoff.
        for _ in 0..(RESUME_BACKOFF_START_TICKS * 8) {
            engine.control_tick();
        }
        assert!(handle.is_running(), "resume retry must eventually succeed");
    }

    #[test]
    fn test_keepalive_ticks_without_wake_lock() {
        let output = ManualOutput::new(SR);
        let mut engine = quiet_engine(output);
        engine.play().unwrap();
        for _ in 0..5 {
            engine.control_tick();
        }
        assert!(engine.keepalive_ticks() >= 5);
    }

    #[test]
    fn test_breath_phase_accessor() {
        let output = ManualOutput::new(SR);
        let handle = output.clone();
        let mut engine = quiet_engine(output);
        assert_eq!(engine.breath_phase(), 0.0);
        engine.play().unwrap();
        handle.advance((BREATH_PERIOD * SR as f64 / 2.0) as usize);
        let phase = engine.breath_phase();
        assert!(phase > 0.0 && phase < 1.0);
    }
}
