// Per-camera acquisition pipeline
//
// Every active source runs two threads:
//
//   FrameSource --(capture thread)--> bounded queue --(decode thread)--> FrameSlot
//
// The capture thread owns the source handle and releases it when it exits.
// Both threads watch the instance's `active` flag; the decode thread also
// exits when the capture side of the queue is gone, after draining it.

pub mod capture;
pub mod decode;
pub mod queue;

pub use queue::{frame_queue, FrameQueue, FrameReceiver, PushOutcome, QueueClosed};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{OverflowPolicy, PipelineConfig};
use crate::devices::SourceDescriptor;
use crate::presentation::FrameSlot;
use crate::video::{DecodedFrame, FrameDecoder, FrameSource};

/// Polling step while waiting for a thread to finish
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Pipeline tuning for one instance
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub frame_timeout: Duration,
    pub decode_timeout: Duration,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            queue_capacity: config.capture_queue_capacity,
            overflow_policy: config.overflow_policy,
            frame_timeout: config.frame_timeout(),
            decode_timeout: config.decode_timeout(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Counters shared by the pipeline threads of one instance
#[derive(Debug, Default)]
pub struct SourceStats {
    dropped: AtomicU64,
    decoded: AtomicU64,
    /// Milliseconds since the instance started, 0 until the first frame
    last_frame_ms: AtomicU64,
}

impl SourceStats {
    pub fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }
}

/// Runtime state of one active camera
pub struct SourceInstance {
    descriptor: SourceDescriptor,
    width: u32,
    height: u32,
    active: AtomicBool,
    stats: SourceStats,
    slot: Arc<FrameSlot>,
    failure: Mutex<Option<String>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl SourceInstance {
    pub fn new(descriptor: SourceDescriptor, width: u32, height: u32) -> Self {
        Self {
            descriptor,
            width,
            height,
            active: AtomicBool::new(false),
            stats: SourceStats::default(),
            slot: Arc::new(FrameSlot::new()),
            failure: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &str {
        &self.descriptor.path
    }

    /// Negotiated (width, height)
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    pub fn dropped_count(&self) -> u64 {
        self.stats.dropped()
    }

    pub fn decoded_count(&self) -> u64 {
        self.stats.decoded()
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn current_frame(&self) -> Option<Arc<DecodedFrame>> {
        self.slot.current()
    }

    /// Time since the last successfully decoded frame
    pub fn last_frame_age(&self) -> Option<Duration> {
        match self.stats.last_frame_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => {
                let at = self.started_at + Duration::from_millis(ms);
                Some(Instant::now().saturating_duration_since(at))
            }
        }
    }

    /// Why the source stopped on its own, if it did
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Source-fatal error: record it and stop the pipeline
    pub(crate) fn mark_failed(&self, reason: String) {
        *self.failure.lock() = Some(reason);
        self.active.store(false, Ordering::Release);
    }

    /// Publish a decoded frame and bump the counters
    pub(crate) fn publish(&self, frame: DecodedFrame) {
        self.slot.publish(Arc::new(frame));
        self.stats.decoded.fetch_add(1, Ordering::Relaxed);
        // Never 0 once a frame was seen, never decreasing
        let ms = (self.started_at.elapsed().as_millis() as u64).max(1);
        self.stats.last_frame_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Start the capture and decode threads. The instance becomes active;
    /// on error nothing is left running and `source` has been released.
    pub fn start(
        self: &Arc<Self>,
        source: Box<dyn FrameSource>,
        decoder: Arc<dyn FrameDecoder>,
        settings: &PipelineSettings,
    ) -> std::io::Result<()> {
        let (queue, rx) = frame_queue(settings.queue_capacity, settings.overflow_policy);
        self.active.store(true, Ordering::Release);

        let decode_instance = self.clone();
        let decode_timeout = settings.decode_timeout;
        let decode = std::thread::Builder::new()
            .name(format!("camview-decode-{}", self.descriptor.index))
            .spawn(move || decode::run_decode(decode_instance, rx, decoder, decode_timeout));
        let decode = match decode {
            Ok(handle) => handle,
            Err(e) => {
                self.active.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let capture_instance = self.clone();
        let frame_timeout = settings.frame_timeout;
        let capture = std::thread::Builder::new()
            .name(format!("camview-capture-{}", self.descriptor.index))
            .spawn(move || capture::run_capture(capture_instance, source, queue, frame_timeout));
        let capture = match capture {
            Ok(handle) => handle,
            Err(e) => {
                // The failed spawn dropped the queue sender, so decode exits
                self.active.store(false, Ordering::Release);
                if decode.join().is_err() {
                    log::error!("{}: decode thread panicked", self.descriptor.path);
                }
                return Err(e);
            }
        };

        self.threads.lock().extend([capture, decode]);
        log::info!(
            "{}: pipeline started at {}x{}",
            self.descriptor.path,
            self.width,
            self.height
        );
        Ok(())
    }

    /// Clear `active` and wait up to `grace` for the pipeline threads.
    /// Returns false if a thread had to be left running.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.active.store(false, Ordering::Release);

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let deadline = Instant::now() + grace;
        let mut clean = true;

        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let name = handle.thread().name().unwrap_or("pipeline").to_string();
            if join_with_grace(handle, remaining).is_none() {
                log::warn!(
                    "{}: {} thread did not exit within {:?}, detaching",
                    self.descriptor.path,
                    name,
                    grace
                );
                clean = false;
            }
        }

        clean
    }

    /// Whether any pipeline thread is still running
    pub fn has_running_threads(&self) -> bool {
        self.threads.lock().iter().any(|h| !h.is_finished())
    }
}

/// Join a thread if it finishes within `grace`. Otherwise the handle is
/// dropped (detaching the thread) and None is returned. A panicked thread is
/// logged and also yields None.
pub fn join_with_grace<T>(handle: JoinHandle<T>, grace: Duration) -> Option<T> {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(JOIN_POLL);
    }

    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            log::error!("Thread panicked before it could be joined");
            None
        }
    }
}
