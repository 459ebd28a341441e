// Video frame handling
//
// This module provides the frame types that flow through a camera pipeline,
// the sources that produce raw MJPEG frames (V4L2 nodes and external capture
// processes) and the JPEG decoder that turns them into RGBA pixel buffers.

pub mod mjpeg;
pub mod process;
pub mod source;

pub use mjpeg::{JpegDecoder, MjpegFramer};
pub use process::{ProcessCommand, ProcessSource, ProcessState};
pub use source::{FrameSource, V4l2Source};

use std::time::Instant;

/// JPEG start-of-image marker
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// One encoded (MJPEG) image as delivered by a capture source.
///
/// The payload is never mutated after the frame is handed to the decode stage.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Encoded JPEG bytes, no separate header
    pub data: Vec<u8>,
    /// Per-source sequence number assigned at capture time
    pub sequence: u64,
    /// Wall-clock time when the frame left the source
    pub captured_at: Instant,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A decompressed RGBA8 pixel buffer ready for texture upload.
///
/// Once published a decoded frame is shared behind an `Arc` and never written
/// again; a new decode always allocates a new buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 rows, `width * height * 4` bytes
    pub pixels: Vec<u8>,
    /// Sequence number of the raw frame this was decoded from
    pub sequence: u64,
}

impl DecodedFrame {
    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    /// RGBA value at (x, y), or None when out of bounds
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride() + x as usize * 4;
        let px = self.pixels.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Nearest-neighbour downscale by an integer factor (thumbnail views).
    /// The result is at least 1x1.
    pub fn downscale(&self, factor: u32) -> DecodedFrame {
        let factor = factor.max(1);
        let width = (self.width / factor).max(1);
        let height = (self.height / factor).max(1);
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);

        for y in 0..height {
            for x in 0..width {
                let src = self
                    .pixel(x * factor, y * factor)
                    .unwrap_or([0, 0, 0, 0xFF]);
                pixels.extend_from_slice(&src);
            }
        }

        DecodedFrame {
            width,
            height,
            pixels,
            sequence: self.sequence,
        }
    }
}

/// Decodes one encoded frame into a pixel buffer.
///
/// Implementations must be usable from the decode thread of every active
/// source at once.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, frame: &RawFrame) -> Result<DecodedFrame, DecodeError>;
}

/// Error type for frame decoding
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,

    #[error("Not a JPEG frame")]
    NotJpeg,

    #[error("JPEG decode error: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("Unsupported pixel format: {0}")]
    UnsupportedPixelFormat(String),

    #[error("Decoded buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Error type for frame source operations (the device handle interface)
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Source delivered an empty frame")]
    EmptyFrame,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Source not started")]
    NotStarted,

    #[error("Source failed: {0}")]
    SourceFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Per-frame errors that only cost a dropped frame. Everything else ends
    /// the capture loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout | DeviceError::EmptyFrame)
    }

    /// Classify a raw IO error coming back from a device read
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => DeviceError::Timeout,
            std::io::ErrorKind::Interrupted => DeviceError::Timeout,
            _ => match err.raw_os_error() {
                // ENODEV / ENXIO: the node went away under us (USB unplug)
                Some(19) | Some(6) => DeviceError::Disconnected,
                _ => DeviceError::Io(err),
            },
        }
    }
}

/// Error type for opening a source
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("Failed to open {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Device {path} does not support {fourcc} (negotiated {negotiated})")]
    UnsupportedFormat {
        path: String,
        fourcc: String,
        negotiated: String,
    },

    #[error("Unknown source: {0}")]
    UnknownSource(String),
}
