// Presentation: hands the latest decoded frame of each source to a sink
//
// The decode thread publishes into a FrameSlot; the render tick reads it. A
// sink only ever sees a complete frame behind an Arc, so it never needs to
// copy under a lock and never mutates what it reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::devices::CameraRegistry;
use crate::pipeline::SourceInstance;
use crate::video::DecodedFrame;

/// Current decoded frame of one source plus the "texture dirty" flag
#[derive(Debug, Default)]
pub struct FrameSlot {
    frame: RwLock<Option<Arc<DecodedFrame>>>,
    dirty: AtomicBool,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame (last writer wins) and mark it dirty
    pub fn publish(&self, frame: Arc<DecodedFrame>) {
        *self.frame.write() = Some(frame);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn current(&self) -> Option<Arc<DecodedFrame>> {
        self.frame.read().clone()
    }

    /// Read and clear the dirty flag
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn clear(&self) {
        *self.frame.write() = None;
        self.dirty.store(false, Ordering::Release);
    }
}

/// Receives frames from the render tick. Implemented by whatever draws.
pub trait PresentationSink {
    /// Upload a new frame (texture upload in a GUI)
    fn upload(&mut self, frame: &DecodedFrame);

    /// Forget the last uploaded frame
    fn invalidate(&mut self);

    /// Show a placeholder instead of a frame
    fn placeholder(&mut self, reason: &str) {
        let _ = reason;
        self.invalidate();
    }

    /// Source counters, offered on every tick while the source is active
    fn source_stats(&mut self, dropped: u64, decoded: u64) {
        let _ = (dropped, decoded);
    }
}

/// What a sink currently shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shown {
    Nothing,
    Placeholder(&'static str),
    Frame(u64),
}

pub const PLACEHOLDER_WAITING: &str = "waiting for frames";
pub const PLACEHOLDER_INACTIVE: &str = "camera inactive";

struct SinkEntry {
    sink: Box<dyn PresentationSink>,
    /// Thumbnail factor, 1 = full size
    scale: u32,
    shown: Shown,
}

/// Drives sinks from the render tick. Sinks are keyed by source path.
#[derive(Default)]
pub struct Presenter {
    sinks: HashMap<String, SinkEntry>,
}

impl Presenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a full-size sink to a source
    pub fn attach(&mut self, path: &str, sink: Box<dyn PresentationSink>) {
        self.attach_scaled(path, sink, 1);
    }

    /// Attach a sink that receives frames downscaled by `scale`
    pub fn attach_scaled(&mut self, path: &str, sink: Box<dyn PresentationSink>, scale: u32) {
        self.sinks.insert(
            path.to_string(),
            SinkEntry {
                sink,
                scale: scale.max(1),
                shown: Shown::Nothing,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// One render tick. Returns the number of frames uploaded.
    pub fn tick(&mut self, registry: &CameraRegistry) -> usize {
        let mut uploads = 0;
        for (path, entry) in self.sinks.iter_mut() {
            let instance = registry.instance(path);
            if present(entry, instance.as_deref()) {
                uploads += 1;
            }
        }
        uploads
    }
}

/// Update one sink from its source. Returns true if a frame was uploaded.
fn present(entry: &mut SinkEntry, instance: Option<&SourceInstance>) -> bool {
    let instance = match instance {
        Some(instance) if instance.is_active() => instance,
        _ => {
            if let Shown::Frame(_) = entry.shown {
                entry.sink.invalidate();
            }
            show_placeholder(entry, PLACEHOLDER_INACTIVE);
            return false;
        }
    };

    entry
        .sink
        .source_stats(instance.dropped_count(), instance.decoded_count());

    // A dirty flag with no frame behind it is tolerated
    if instance.slot().take_dirty() {
        if let Some(frame) = instance.current_frame() {
            if entry.scale > 1 {
                entry.sink.upload(&frame.downscale(entry.scale));
            } else {
                entry.sink.upload(&frame);
            }
            entry.shown = Shown::Frame(frame.sequence);
            return true;
        }
    }

    if !matches!(entry.shown, Shown::Frame(_)) {
        show_placeholder(entry, PLACEHOLDER_WAITING);
    }
    false
}

fn show_placeholder(entry: &mut SinkEntry, reason: &'static str) {
    if entry.shown != Shown::Placeholder(reason) {
        entry.sink.placeholder(reason);
        entry.shown = Shown::Placeholder(reason);
    }
}

/// Headless sink that logs frame rate, drops and resolution periodically
pub struct StatsSink {
    label: String,
    interval: Duration,
    window_start: Instant,
    window_frames: u64,
    total_frames: u64,
    dropped: u64,
    resolution: Option<(u32, u32)>,
    last_fps: f64,
}

impl StatsSink {
    /// `interval` of zero disables logging; counters are still kept
    pub fn new(label: impl Into<String>, interval: Duration) -> Self {
        Self {
            label: label.into(),
            interval,
            window_start: Instant::now(),
            window_frames: 0,
            total_frames: 0,
            dropped: 0,
            resolution: None,
            last_fps: 0.0,
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn last_fps(&self) -> f64 {
        self.last_fps
    }

    fn maybe_report(&mut self) {
        if self.interval.is_zero() {
            return;
        }
        let elapsed = self.window_start.elapsed();
        if elapsed < self.interval {
            return;
        }

        self.last_fps = self.window_frames as f64 / elapsed.as_secs_f64();
        match self.resolution {
            Some((w, h)) => log::info!(
                "{}: {:.1} fps, {} dropped, {}x{}",
                self.label,
                self.last_fps,
                self.dropped,
                w,
                h
            ),
            None => log::info!("{}: no frames yet, {} dropped", self.label, self.dropped),
        }

        self.window_start = Instant::now();
        self.window_frames = 0;
    }
}

impl PresentationSink for StatsSink {
    fn upload(&mut self, frame: &DecodedFrame) {
        self.window_frames += 1;
        self.total_frames += 1;
        self.resolution = Some((frame.width, frame.height));
        self.maybe_report();
    }

    fn invalidate(&mut self) {
        self.resolution = None;
    }

    fn placeholder(&mut self, reason: &str) {
        log::info!("{}: {}", self.label, reason);
        self.invalidate();
    }

    fn source_stats(&mut self, dropped: u64, _decoded: u64) {
        self.dropped = dropped;
        self.maybe_report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Arc<DecodedFrame> {
        Arc::new(DecodedFrame {
            width: 2,
            height: 2,
            pixels: vec![9; 16],
            sequence: seq,
        })
    }

    #[test]
    fn slot_is_last_writer_wins() {
        let slot = FrameSlot::new();
        assert!(slot.current().is_none());
        assert!(!slot.take_dirty());

        slot.publish(frame(1));
        slot.publish(frame(2));
        assert_eq!(slot.current().map(|f| f.sequence), Some(2));
        assert!(slot.take_dirty());
        assert!(!slot.take_dirty());
    }

    #[test]
    fn readers_keep_their_frame_after_replacement() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        let held = slot.current().unwrap();
        slot.publish(frame(2));
        assert_eq!(held.sequence, 1);
        assert_eq!(held.pixels, vec![9; 16]);
    }

    #[test]
    fn clear_drops_frame_and_flag() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        slot.clear();
        assert!(slot.current().is_none());
        assert!(!slot.take_dirty());
    }

    #[test]
    fn stats_sink_counts_uploads() {
        let mut sink = StatsSink::new("cam0", Duration::ZERO);
        sink.upload(&frame(1));
        sink.upload(&frame(2));
        sink.source_stats(4, 2);
        assert_eq!(sink.total_frames(), 2);
        assert_eq!(sink.dropped, 4);
        assert_eq!(sink.resolution, Some((2, 2)));

        sink.placeholder(PLACEHOLDER_INACTIVE);
        assert_eq!(sink.resolution, None);
    }

    #[test]
    fn stats_sink_reports_fps_after_interval() {
        let mut sink = StatsSink::new("cam0", Duration::from_millis(20));
        sink.upload(&frame(1));
        std::thread::sleep(Duration::from_millis(30));
        sink.upload(&frame(2));
        assert!(sink.last_fps() > 0.0);
        assert_eq!(sink.window_frames, 0);
    }
}
