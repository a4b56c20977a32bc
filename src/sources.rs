//! External data sources: clock, impulse responses, rendered fallback audio
//!
//! These are collaborators, specified at their interface. Every failure is
//! non-fatal: the engine falls back to the last known clock value, to a
//! dry-only wet stage, or to silence. Fetches run on a worker thread with
//! an abort flag, so a stale request (phrase change, stop, drop) never
//! lands late.

use crate::cache::BoundedCache;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::warn;

/// Default capacity for the impulse-response and fallback-audio caches.
pub const BUFFER_CACHE_CAPACITY: usize = 8;

/// Cooperative cancellation handle passed into every fetch. A provider
/// doing slow I/O should check it between steps and bail out early; the
/// result of a cancelled fetch is discarded either way.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// "Fetch current external time value" collaborator. Returns seconds,
/// non-negative, roughly monotonic.
pub trait ClockSource: Send + Sync {
    fn fetch(&self) -> Result<f64, String>;
}

/// Resolves a phrase slug to a decoded mono impulse response.
pub trait ImpulseResponseProvider: Send + Sync {
    fn fetch(&self, phrase_slug: &str, cancel: &CancelToken) -> Result<Arc<Vec<f32>>, String>;
}

/// Resolves (frequency, phrase slug) to a pre-rendered audio buffer used
/// only while backgrounded.
pub trait RenderedFallbackProvider: Send + Sync {
    fn fetch(
        &self,
        frequency_hz: f64,
        phrase_slug: &str,
        cancel: &CancelToken,
    ) -> Result<Arc<Vec<f32>>, String>;
}

/// Local monotonic clock, the built-in fallback when no external clock
/// collaborator is configured.
pub struct LocalClock {
    epoch: Instant,
}

impl LocalClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for LocalClock {
    fn fetch(&self) -> Result<f64, String> {
        Ok(self.epoch.elapsed().as_secs_f64())
    }
}

struct Inflight {
    key: String,
    cancel: CancelToken,
    rx: Receiver<Result<Arc<Vec<f32>>, String>>,
}

/// Completed fetch, as reported by [`BufferFetcher::poll`].
pub struct Fetched {
    pub key: String,
    pub result: Result<Arc<Vec<f32>>, String>,
}

/// Fetch-with-cache-and-abort wrapper around a buffer provider.
///
/// At most one request is in flight; a new request supersedes (aborts)
/// the previous one. Successful results land in the bounded cache.
pub struct BufferFetcher {
    cache: BoundedCache<String, Arc<Vec<f32>>>,
    inflight: Option<Inflight>,
}

impl BufferFetcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: BoundedCache::new(capacity),
            inflight: None,
        }
    }

    pub fn cached(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        self.cache.get(&key.to_string())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Start a fetch on a worker thread. `fetch` runs off-thread with a
    /// [`CancelToken`] it should observe; the result is collected by
    /// [`poll`]. Any in-flight request for another key is aborted first.
    pub fn request<F>(&mut self, key: &str, fetch: F)
    where
        F: FnOnce(CancelToken) -> Result<Arc<Vec<f32>>, String> + Send + 'static,
    {
        if let Some(inflight) = &self.inflight {
            if inflight.key == key {
                return;
            }
        }
        self.abort();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let (tx, rx) = channel();
        thread::spawn(move || {
            let result = fetch(token.clone());
            if !token.is_cancelled() {
                let _ = tx.send(result);
            }
        });
        self.inflight = Some(Inflight {
            key: key.to_string(),
            cancel,
            rx,
        });
    }

    /// Collect a finished fetch, if any. Successful buffers are cached.
    pub fn poll(&mut self) -> Option<Fetched> {
        let inflight = self.inflight.as_ref()?;
        match inflight.rx.try_recv() {
            Ok(result) => {
                let key = inflight.key.clone();
                self.inflight = None;
                if let Ok(buffer) = &result {
                    self.cache.insert(key.clone(), Arc::clone(buffer));
                } else if let Err(e) = &result {
                    warn!("fetch for '{}' failed: {}", key, e);
                }
                Some(Fetched { key, result })
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                let key = inflight.key.clone();
                self.inflight = None;
                Some(Fetched {
                    key,
                    result: Err("fetch worker vanished".to_string()),
                })
            }
        }
    }

    /// Abort the in-flight request, if any. The token flips so a provider
    /// mid-fetch can bail out; whatever it returns is discarded.
    pub fn abort(&mut self) {
        if let Some(inflight) = self.inflight.take() {
            inflight.cancel.cancel();
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.inflight.is_some()
    }
}

impl Drop for BufferFetcher {
    fn drop(&mut self) {
        self.abort();
    }
}

/// One-shot background read of a [`ClockSource`]. The scheduler polls
/// this from its control tick, so a stalled clock collaborator can never
/// block the caller; the audio path shares a lock with that tick.
pub struct ClockReader {
    inflight: Option<(CancelToken, Receiver<Result<f64, String>>)>,
}

impl ClockReader {
    pub fn new() -> Self {
        Self { inflight: None }
    }

    /// Ask for a fresh clock value. A request already in flight is left
    /// alone; its answer is still wanted.
    pub fn request(&mut self, clock: Arc<dyn ClockSource>) {
        if self.inflight.is_some() {
            return;
        }
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let (tx, rx) = channel();
        thread::spawn(move || {
            let result = clock.fetch();
            if !token.is_cancelled() {
                let _ = tx.send(result);
            }
        });
        self.inflight = Some((cancel, rx));
    }

    /// Collect the reading, if it has arrived. Never blocks.
    pub fn poll(&mut self) -> Option<Result<f64, String>> {
        let (_, rx) = self.inflight.as_ref()?;
        match rx.try_recv() {
            Ok(result) => {
                self.inflight = None;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.inflight = None;
                Some(Err("clock worker vanished".to_string()))
            }
        }
    }

    pub fn abort(&mut self) {
        if let Some((cancel, _)) = self.inflight.take() {
            cancel.cancel();
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.inflight.is_some()
    }
}

impl Default for ClockReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClockReader {
    fn drop(&mut self) {
        self.abort();
    }
}
