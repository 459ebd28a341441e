// MJPEG stream framing and JPEG decoding
//
// External capture processes (rpicam-vid) write a bare MJPEG byte stream to
// stdout: concatenated JPEG images with no container. The framer cuts that
// stream back into discrete frames using the SOI/EOI markers.
//
// The decoder wraps jpeg-decoder and always produces RGBA8 so every
// presentation sink can upload the same layout.

use jpeg_decoder::PixelFormat;

use super::{DecodeError, DecodedFrame, FrameDecoder, RawFrame, JPEG_EOI, JPEG_SOI};

/// Default upper bound for a single frame. A stream that never closes a frame
/// within this many bytes is treated as garbage and discarded.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Incremental MJPEG reframer.
///
/// Bytes are appended with [`MjpegFramer::push`]; every complete
/// `FF D8 ... FF D9` run is sliced out as a [`RawFrame`]. Only the unconsumed
/// remainder is retained and scanning resumes where the previous call stopped,
/// so each input byte is examined a bounded number of times.
pub struct MjpegFramer {
    buffer: Vec<u8>,
    /// Offset of the SOI marker of the frame being assembled
    frame_start: Option<usize>,
    /// Next offset to scan from
    scan_pos: usize,
    max_frame_bytes: usize,
    next_sequence: u64,
    /// Bytes thrown away because they were outside any frame
    discarded_bytes: u64,
}

impl MjpegFramer {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(256 * 1024),
            frame_start: None,
            scan_pos: 0,
            max_frame_bytes: max_frame_bytes.max(4),
            next_sequence: 0,
            discarded_bytes: 0,
        }
    }

    /// Append a chunk of stream bytes and return every frame it completed,
    /// in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        // Bytes before this offset are emitted or discarded. They are removed
        // in one go after the scan.
        let mut consumed = 0;

        loop {
            match self.frame_start {
                None => match find_marker(&self.buffer, self.scan_pos, JPEG_SOI) {
                    Some(idx) => {
                        self.discarded_bytes += (idx - consumed) as u64;
                        consumed = idx;
                        self.frame_start = Some(idx);
                        self.scan_pos = idx + JPEG_SOI.len();
                    }
                    None => {
                        // Keep a trailing 0xFF, it may be the first half of a
                        // marker split across reads
                        let len = self.buffer.len();
                        let keep_from = if self.buffer.last() == Some(&0xFF) {
                            (len - 1).max(consumed)
                        } else {
                            len
                        };
                        self.discarded_bytes += (keep_from - consumed) as u64;
                        consumed = keep_from;
                        self.scan_pos = keep_from;
                        break;
                    }
                },
                Some(start) => match find_marker(&self.buffer, self.scan_pos, JPEG_EOI) {
                    Some(idx) => {
                        let end = idx + JPEG_EOI.len();
                        let data = self.buffer[start..end].to_vec();
                        frames.push(RawFrame::new(data, self.next_sequence));
                        self.next_sequence += 1;

                        consumed = end;
                        self.frame_start = None;
                        self.scan_pos = end;
                    }
                    None => {
                        let len = self.buffer.len();
                        if len - start > self.max_frame_bytes {
                            log::warn!(
                                "MJPEG frame exceeded {} bytes without an end marker, discarding",
                                self.max_frame_bytes
                            );
                            self.discarded_bytes += (len - consumed) as u64;
                            consumed = len;
                            self.frame_start = None;
                            self.scan_pos = len;
                            break;
                        }
                        // Resume on the last byte next time in case the end
                        // marker straddles two reads
                        self.scan_pos = len.saturating_sub(1).max(start + JPEG_SOI.len());
                        break;
                    }
                },
            }
        }

        self.buffer.drain(..consumed);
        self.scan_pos -= consumed;
        if let Some(start) = self.frame_start.as_mut() {
            *start -= consumed;
        }
        frames
    }

    /// Bytes currently held for an incomplete frame
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes dropped because they were outside any frame
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Number of frames emitted so far
    pub fn frames_emitted(&self) -> u64 {
        self.next_sequence
    }

    /// Forget any partial frame (used when the producing process restarts)
    pub fn reset(&mut self) {
        self.discarded_bytes += self.buffer.len() as u64;
        self.buffer.clear();
        self.frame_start = None;
        self.scan_pos = 0;
    }
}

impl Default for MjpegFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Find `marker` at or after `from`
fn find_marker(buffer: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

/// JPEG decoder producing RGBA8 frames
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegDecoder;

impl JpegDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl FrameDecoder for JpegDecoder {
    fn decode(&self, frame: &RawFrame) -> Result<DecodedFrame, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::Empty);
        }
        if !frame.data.starts_with(&JPEG_SOI) {
            return Err(DecodeError::NotJpeg);
        }

        let mut decoder = jpeg_decoder::Decoder::new(frame.data.as_slice());
        let pixels = decoder.decode()?;
        let info = decoder
            .info()
            .ok_or_else(|| DecodeError::UnsupportedPixelFormat("missing image info".into()))?;

        let width = info.width as u32;
        let height = info.height as u32;
        let pixel_count = width as usize * height as usize;
        let rgba = to_rgba(info.pixel_format, &pixels, pixel_count)?;

        Ok(DecodedFrame {
            width,
            height,
            pixels: rgba,
            sequence: frame.sequence,
        })
    }
}

/// Expand decoder output into RGBA8
fn to_rgba(format: PixelFormat, pixels: &[u8], pixel_count: usize) -> Result<Vec<u8>, DecodeError> {
    let bytes_per_pixel = match format {
        PixelFormat::L8 => 1,
        PixelFormat::L16 => 2,
        PixelFormat::RGB24 => 3,
        PixelFormat::CMYK32 => 4,
    };
    let expected = pixel_count * bytes_per_pixel;
    if pixels.len() != expected {
        return Err(DecodeError::SizeMismatch {
            expected,
            actual: pixels.len(),
        });
    }

    let mut rgba = Vec::with_capacity(pixel_count * 4);
    match format {
        PixelFormat::RGB24 => {
            for px in pixels.chunks_exact(3) {
                rgba.extend_from_slice(&[px[0], px[1], px[2], 0xFF]);
            }
        }
        PixelFormat::L8 => {
            for &l in pixels {
                rgba.extend_from_slice(&[l, l, l, 0xFF]);
            }
        }
        PixelFormat::L16 => {
            for px in pixels.chunks_exact(2) {
                let l = px[0];
                rgba.extend_from_slice(&[l, l, l, 0xFF]);
            }
        }
        PixelFormat::CMYK32 => {
            return Err(DecodeError::UnsupportedPixelFormat("CMYK32".into()));
        }
    }
    Ok(rgba)
}
