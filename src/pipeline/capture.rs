// Frame capture stage

use std::sync::Arc;
use std::time::Duration;

use super::{FrameQueue, SourceInstance};
use crate::video::FrameSource;

/// Capture thread body. Pulls frames until the instance is deactivated or the
/// source fails, then stops and releases the source.
pub(crate) fn run_capture(
    instance: Arc<SourceInstance>,
    mut source: Box<dyn FrameSource>,
    queue: FrameQueue,
    timeout: Duration,
) {
    let path = instance.path().to_string();
    log::debug!("{}: capture thread started ({:?} on overflow)", path, queue.policy());

    while instance.is_active() {
        let result = source.next_frame(timeout);

        let internal = source.take_dropped();
        if internal > 0 {
            instance.stats().add_dropped(internal);
        }

        match result {
            Ok(frame) => match queue.push(frame) {
                Ok(outcome) if outcome.dropped() => {
                    instance.stats().add_dropped(1);
                    log::trace!("{}: queue full, {:?}", path, outcome);
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("{}: {}, stopping capture", path, e);
                    instance.mark_failed(e.to_string());
                    break;
                }
            },
            Err(e) if e.is_transient() => {
                instance.stats().add_dropped(1);
                log::trace!("{}: {}", path, e);
            }
            Err(e) => {
                log::error!("{}: capture failed: {}", path, e);
                instance.mark_failed(e.to_string());
                break;
            }
        }
    }

    source.stop();
    drop(source);
    log::debug!(
        "{}: capture thread exiting ({} dropped)",
        path,
        instance.dropped_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::config::OverflowPolicy;
    use crate::devices::SourceDescriptor;
    use crate::pipeline::frame_queue;
    use crate::video::{DeviceError, RawFrame};

    /// Plays back a fixed script of results, then reports a disconnect
    struct ScriptedSource {
        script: VecDeque<Result<Vec<u8>, DeviceError>>,
        sequence: u64,
        internal_drops: u64,
        stopped: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn start(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<RawFrame, DeviceError> {
            match self.script.pop_front() {
                Some(Ok(data)) => {
                    self.sequence += 1;
                    Ok(RawFrame::new(data, self.sequence - 1))
                }
                Some(Err(e)) => Err(e),
                None => Err(DeviceError::Disconnected),
            }
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn resolution(&self) -> (u32, u32) {
            (640, 480)
        }

        fn take_dropped(&mut self) -> u64 {
            std::mem::take(&mut self.internal_drops)
        }
    }

    fn active_instance() -> Arc<SourceInstance> {
        let inst = Arc::new(SourceInstance::new(
            SourceDescriptor::v4l2("/dev/video0", "Scripted", 0),
            640,
            480,
        ));
        inst.active.store(true, Ordering::Release);
        inst
    }

    #[test]
    fn timeouts_and_overflow_count_as_drops() {
        let stopped = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource {
            script: VecDeque::from(vec![
                Ok(vec![1]),
                Err(DeviceError::Timeout),
                Ok(vec![2]),
                Err(DeviceError::EmptyFrame),
                Ok(vec![3]),
                Ok(vec![4]),
            ]),
            sequence: 0,
            internal_drops: 2,
            stopped: stopped.clone(),
        };
        let inst = active_instance();
        let (queue, rx) = frame_queue(3, OverflowPolicy::DropNewest);

        run_capture(inst.clone(), Box::new(source), queue, Duration::from_millis(10));

        // 1 timeout + 1 empty + 1 overflow + 2 internal
        assert_eq!(inst.dropped_count(), 5);
        let queued: Vec<u8> = rx.try_iter().map(|f| f.data[0]).collect();
        assert_eq!(queued, vec![1, 2, 3]);

        // The trailing disconnect is source-fatal
        assert!(!inst.is_active());
        assert!(inst.failure().is_some());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn inactive_instance_never_reads() {
        let stopped = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource {
            script: VecDeque::from(vec![Ok(vec![1])]),
            sequence: 0,
            internal_drops: 0,
            stopped: stopped.clone(),
        };
        let inst = active_instance();
        inst.active.store(false, Ordering::Release);
        let (queue, rx) = frame_queue(3, OverflowPolicy::DropNewest);

        run_capture(inst.clone(), Box::new(source), queue, Duration::from_millis(10));

        assert!(rx.try_recv().is_err());
        assert!(inst.failure().is_none());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn dead_decoder_fails_the_source_when_evicting() {
        let stopped = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource {
            script: (0..10).map(|i| Ok(vec![i])).collect(),
            sequence: 0,
            internal_drops: 0,
            stopped: stopped.clone(),
        };
        let inst = active_instance();
        let (queue, rx) = frame_queue(2, OverflowPolicy::EvictOldest);
        drop(rx);

        run_capture(inst.clone(), Box::new(source), queue, Duration::from_millis(10));

        assert!(!inst.is_active());
        assert_eq!(inst.failure().as_deref(), Some("Frame queue closed"));
        assert_eq!(inst.dropped_count(), 0);
        assert!(stopped.load(Ordering::SeqCst));
    }
}
