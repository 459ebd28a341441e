// Frame sources
//
// A frame source is the device handle of one camera: it is opened with a
// requested resolution, started, polled for raw MJPEG frames by the capture
// thread and stopped. Only the capture thread of the owning source instance
// ever calls into it.

use std::time::Duration;

use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream, Stream as StreamTrait};
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{DeviceError, OpenError, RawFrame};

/// MJPEG fourcc requested from every V4L2 device
pub const MJPEG_FOURCC: &[u8; 4] = b"MJPG";

/// Default number of mmap buffers queued with the driver
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Device handle interface consumed by the capture stage
pub trait FrameSource: Send {
    /// Begin streaming. Errors here are activation-fatal.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Block for the next frame, at most `timeout`.
    ///
    /// Transient errors ([`DeviceError::is_transient`]) cost one dropped
    /// frame; anything else is fatal for the source.
    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, DeviceError>;

    /// Stop streaming and release hardware/process resources. Safe to call
    /// more than once.
    fn stop(&mut self);

    /// Negotiated (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Frames the source dropped internally since the last call. Sources with
    /// their own buffering (external processes) report here so the instance
    /// counter stays complete.
    fn take_dropped(&mut self) -> u64 {
        0
    }
}

/// V4L2 capture node streaming MJPEG through mmap buffers
pub struct V4l2Source {
    path: String,
    width: u32,
    height: u32,
    buffer_count: u32,
    // Declared before `device` so the stream is torn down first
    stream: Option<Stream<'static>>,
    device: Device,
    timeout: Option<Duration>,
    sequence: u64,
}

impl V4l2Source {
    /// Open a V4L2 node and negotiate MJPEG at the requested resolution.
    ///
    /// Drivers may pick a different size; the negotiated one is kept. A
    /// driver that refuses MJPEG altogether is an open error.
    pub fn open(path: &str, width: u32, height: u32, fps: u32) -> Result<Self, OpenError> {
        let io_err = |source: std::io::Error| OpenError::Io {
            path: path.to_string(),
            source,
        };

        let device = Device::with_path(path).map_err(io_err)?;

        let mut format = device.format().map_err(io_err)?;
        format.width = width;
        format.height = height;
        format.fourcc = FourCC::new(MJPEG_FOURCC);
        let negotiated = device.set_format(&format).map_err(io_err)?;

        if negotiated.fourcc != FourCC::new(MJPEG_FOURCC) {
            return Err(OpenError::UnsupportedFormat {
                path: path.to_string(),
                fourcc: "MJPG".to_string(),
                negotiated: negotiated.fourcc.to_string(),
            });
        }

        if fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(fps);
            if let Err(e) = device.set_params(&params) {
                log::debug!("{}: could not set {} fps: {}", path, fps, e);
            }
        }

        let (actual_width, actual_height) = if negotiated.width > 0 && negotiated.height > 0 {
            (negotiated.width, negotiated.height)
        } else {
            (width, height)
        };

        if (actual_width, actual_height) != (width, height) {
            log::info!(
                "{}: requested {}x{}, driver negotiated {}x{}",
                path, width, height, actual_width, actual_height
            );
        }

        Ok(Self {
            path: path.to_string(),
            width: actual_width,
            height: actual_height,
            buffer_count: DEFAULT_BUFFER_COUNT,
            stream: None,
            device,
            timeout: None,
            sequence: 0,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FrameSource for V4l2Source {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        StreamTrait::start(&mut stream)?;
        self.stream = Some(stream);
        self.timeout = None;

        log::debug!("{}: streaming with {} buffers", self.path, self.buffer_count);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotStarted)?;

        if self.timeout != Some(timeout) {
            stream.set_timeout(timeout);
            self.timeout = Some(timeout);
        }

        let (buf, meta) = CaptureStream::next(stream).map_err(DeviceError::from_io)?;
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(DeviceError::EmptyFrame);
        }

        let frame = RawFrame::new(buf[..used].to_vec(), self.sequence);
        self.sequence += 1;
        Ok(frame)
    }

    fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = StreamTrait::stop(&mut stream) {
                log::debug!("{}: stream stop failed: {}", self.path, e);
            }
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.stop();
    }
}
