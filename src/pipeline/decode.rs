// Frame decode stage

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use super::{FrameReceiver, SourceInstance};
use crate::video::{FrameDecoder, RawFrame};

/// Decode thread body. Frames are decoded in queue order; a failed decode
/// costs exactly one dropped frame. Exits when the instance is deactivated
/// and idle, or when the capture side is gone and the queue is drained.
pub(crate) fn run_decode(
    instance: Arc<SourceInstance>,
    rx: FrameReceiver,
    decoder: Arc<dyn FrameDecoder>,
    timeout: Duration,
) {
    let path = instance.path().to_string();
    log::debug!("{}: decode thread started", path);

    loop {
        match rx.recv_timeout(timeout) {
            Ok(frame) => decode_one(&instance, decoder.as_ref(), &frame),
            Err(RecvTimeoutError::Timeout) => {
                if !instance.is_active() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!(
        "{}: decode thread exiting ({} decoded)",
        path,
        instance.decoded_count()
    );
}

fn decode_one(instance: &SourceInstance, decoder: &dyn FrameDecoder, frame: &RawFrame) {
    match decoder.decode(frame) {
        Ok(decoded) => instance.publish(decoded),
        Err(e) => {
            instance.stats().add_dropped(1);
            log::debug!(
                "{}: dropping frame {} ({} bytes): {}",
                instance.path(),
                frame.sequence,
                frame.len(),
                e
            );
        }
    }
}
