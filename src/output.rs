//! Audio output devices
//!
//! Real-time output goes through cpal (JACK, ALSA, OpenSL ES, etc.)
//! behind the `AudioOutput` seam. `ManualOutput` is the deterministic
//! double used by lifecycle tests: frames advance only when the test
//! pulls them, and every start/close is counted.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{error, info, warn};

/// Renders interleaved-deinterleaved stereo frames into `left`/`right`.
pub type RenderFn = Box<dyn FnMut(&mut [f32], &mut [f32]) + Send>;

/// The output device seam. One session owns at most one output; the
/// lifecycle manager disposes it before creating the next.
pub trait AudioOutput: Send {
    fn sample_rate(&self) -> f32;

    /// Install the render callback and begin pulling frames.
    fn start(&mut self, render: RenderFn) -> Result<(), String>;

    /// Whether the device is currently pulling frames.
    fn is_running(&self) -> bool;

    /// Attempt to resume a suspended device. Failure is retryable.
    fn resume(&mut self) -> Result<(), String>;

    /// Best-effort teardown; never errors.
    fn close(&mut self);
}

/// cpal-backed real-time output.
///
/// `cpal::Stream` is not `Send`, so the stream lives on a dedicated
/// thread for its whole life; this handle talks to it over a channel.
pub struct CpalOutput {
    sample_rate: f32,
    worker: Option<StreamWorker>,
}

enum StreamCommand {
    Resume(Sender<Result<(), String>>),
    Quit,
}

struct StreamWorker {
    tx: Sender<StreamCommand>,
    handle: thread::JoinHandle<()>,
    running: Arc<AtomicBool>,
}

impl CpalOutput {
    pub fn new() -> Result<Self, String> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| "no audio output device found".to_string())?;
        let config = device
            .default_output_config()
            .map_err(|e| format!("no default output config: {}", e))?;
        info!(
            "audio host {:?}, device {}, config {:?}",
            host.id(),
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            config
        );
        Ok(Self {
            sample_rate: config.sample_rate().0 as f32,
            worker: None,
        })
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn start(&mut self, render: RenderFn) -> Result<(), String> {
        self.close();
        let (tx, rx) = channel();
        let (ready_tx, ready_rx) = channel();
        let running = Arc::new(AtomicBool::new(false));
        let running_flag = Arc::clone(&running);
        let handle = thread::spawn(move || {
            run_stream_thread(render, rx, ready_tx, running_flag);
        });
        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("audio stream started at {} Hz", self.sample_rate);
                self.worker = Some(StreamWorker {
                    tx,
                    handle,
                    running,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err("audio stream thread died during startup".to_string())
            }
        }
    }

    fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| w.running.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn resume(&mut self) -> Result<(), String> {
        match &self.worker {
            Some(worker) => {
                let (reply_tx, reply_rx) = channel();
                worker
                    .tx
                    .send(StreamCommand::Resume(reply_tx))
                    .map_err(|_| "audio stream thread gone".to_string())?;
                reply_rx
                    .recv()
                    .map_err(|_| "audio stream thread gone".to_string())?
            }
            None => Err("no stream to resume".to_string()),
        }
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.tx.send(StreamCommand::Quit);
            if worker.handle.join().is_err() {
                warn!("audio stream thread panicked during close");
            }
            info!("audio stream closed");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the `cpal::Stream` for its whole life. Exits on `Quit` or when
/// the handle side hangs up.
fn run_stream_thread(
    render: RenderFn,
    rx: Receiver<StreamCommand>,
    ready_tx: Sender<Result<(), String>>,
    running: Arc<AtomicBool>,
) {
    let stream = match open_stream(render) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    running.store(true, Ordering::Relaxed);
    let _ = ready_tx.send(Ok(()));

    while let Ok(command) = rx.recv() {
        match command {
            StreamCommand::Resume(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| format!("stream resume failed: {}", e));
                if result.is_ok() {
                    running.store(true, Ordering::Relaxed);
                }
                let _ = reply.send(result);
            }
            StreamCommand::Quit => break,
        }
    }
    running.store(false, Ordering::Relaxed);
    drop(stream);
}

fn open_stream(render: RenderFn) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no audio output device found".to_string())?;
    let config = device
        .default_output_config()
        .map_err(|e| format!("no default output config: {}", e))?;
    let channels = config.channels() as usize;
    let render = Arc::new(Mutex::new(render));

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), render, channels),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), render, channels),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), render, channels),
        other => return Err(format!("unsupported sample format {:?}", other)),
    }?;

    stream
        .play()
        .map_err(|e| format!("stream start failed: {}", e))?;
    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    render: Arc<Mutex<RenderFn>>,
    channels: usize,
) -> Result<cpal::Stream, String>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut left = Vec::new();
    let mut right = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                left.resize(frames, 0.0);
                right.resize(frames, 0.0);
                {
                    let mut render = match render.lock() {
                        Ok(r) => r,
                        Err(_) => {
                            warn!("render callback poisoned, emitting silence");
                            for sample in data.iter_mut() {
                                *sample = T::from_sample(0.0);
                            }
                            return;
                        }
                    };
                    render(&mut left, &mut right);
                }
                for (i, frame) in data.chunks_mut(channels).enumerate() {
                    for (ch, sample) in frame.iter_mut().enumerate() {
                        let v = if ch % 2 == 0 { left[i] } else { right[i] };
                        *sample = T::from_sample(v);
                    }
                }
            },
            |err| error!("audio stream error: {}", err),
            None,
        )
        .map_err(|e| format!("stream build failed: {}", e))
}

/// Deterministic output double. Frames move only through [`advance`], so
/// tests control the audio clock exactly; `started`/`closed` counters
/// verify that every start has a matching close. Clones share one device,
/// so a test can keep a handle while the engine owns a boxed clone.
#[derive(Clone)]
pub struct ManualOutput {
    sample_rate: f32,
    inner: Arc<Mutex<ManualInner>>,
    pub started: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

struct ManualInner {
    render: Option<RenderFn>,
    suspended: bool,
    resume_failures_left: usize,
}

impl ManualOutput {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            inner: Arc::new(Mutex::new(ManualInner {
                render: None,
                suspended: false,
                resume_failures_left: 0,
            })),
            started: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start in a suspended state, rejecting the next `failures` resume
    /// attempts. Models autoplay-policy suspension.
    pub fn suspended_for(self, failures: usize) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.suspended = true;
            inner.resume_failures_left = failures;
        }
        self
    }

    /// Pull `frames` frames through the render callback.
    pub fn advance(&self, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        let mut inner = self.inner.lock().unwrap();
        if !inner.suspended {
            if let Some(render) = &mut inner.render {
                render(&mut left, &mut right);
            }
        }
        (left, right)
    }
}

impl AudioOutput for ManualOutput {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn start(&mut self, render: RenderFn) -> Result<(), String> {
        self.inner.lock().unwrap().render = Some(render);
        self.started.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_running(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.render.is_some() && !inner.suspended
    }

    fn resume(&mut self) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.suspended {
            return Ok(());
        }
        if inner.resume_failures_left > 0 {
            inner.resume_failures_left -= 1;
            Err("resume rejected".to_string())
        } else {
            inner.suspended = false;
            Ok(())
        }
    }

    fn close(&mut self) {
        if self.inner.lock().unwrap().render.take().is_some() {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_output_counts_lifecycle() {
        let mut out = ManualOutput::new(48_000.0);
        out.start(Box::new(|l, _r| l.fill(0.25))).unwrap();
        assert!(out.is_running());
        let (left, _) = out.advance(16);
        assert!(left.iter().all(|&s| s == 0.25));
        out.close();
        out.close(); // double close is a no-op
        assert_eq!(out.started.load(Ordering::Relaxed), 1);
        assert_eq!(out.closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_manual_output_clones_share_device() {
        let mut owner = ManualOutput::new(48_000.0);
        let observer = owner.clone();
        owner.start(Box::new(|l, _r| l.fill(1.0))).unwrap();
        let (left, _) = observer.advance(4);
        assert_eq!(left, vec![1.0; 4]);
        assert_eq!(observer.started.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_manual_output_resume_backoff_path() {
        let mut out = ManualOutput::new(48_000.0).suspended_for(2);
        out.start(Box::new(|_l, _r| {})).unwrap();
        assert!(!out.is_running());
        assert!(out.resume().is_err());
        assert!(out.resume().is_err());
        assert!(out.resume().is_ok());
        assert!(out.is_running());
    }
}
