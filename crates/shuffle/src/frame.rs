//! Length-prefixed frames on a shared byte stream.
//!
//! Wire format per frame:
//! `[u64 LE compressed_len][u64 LE uncompressed_len][compressed_len payload bytes]`.
//! A stream may only end at a frame boundary.

use std::io::{self, ErrorKind, Read, Write};

use nbx_common::{NbxError, Result};

pub const FRAME_HEADER_LEN: usize = 16;

/// Payload buffers grow past this only as bytes actually arrive.
const PAYLOAD_PREALLOC_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub compressed_len: u64,
    pub uncompressed_len: u64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0_u8; FRAME_HEADER_LEN];
        out[..8].copy_from_slice(&self.compressed_len.to_le_bytes());
        out[8..].copy_from_slice(&self.uncompressed_len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        let mut compressed = [0_u8; 8];
        let mut uncompressed = [0_u8; 8];
        compressed.copy_from_slice(&bytes[..8]);
        uncompressed.copy_from_slice(&bytes[8..]);
        Self {
            compressed_len: u64::from_le_bytes(compressed),
            uncompressed_len: u64::from_le_bytes(uncompressed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// No header buffered; the next `has_next` reads one.
    AtBoundary,
    /// A header was read and not yet handed out by `next_frame`.
    HeaderReady(FrameHeader),
    Finished,
    Corrupted,
}

/// Splits one byte stream into sequential frames.
///
/// Payloads are never buffered here: each [`Frame`] reads its bytes straight
/// from the underlying stream, and the next header is only read once the
/// previous payload has been fully consumed.
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: u64,
    state: ReaderState,
    /// Payload bytes of the last handed-out frame still unread.
    pending: u64,
    frames: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: u64) -> Self {
        Self {
            inner,
            max_frame_bytes,
            state: ReaderState::AtBoundary,
            pending: 0,
            frames: 0,
        }
    }

    /// Frames handed out so far.
    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    /// Whether another frame follows.
    ///
    /// Returns `false` only on a clean end of stream at a frame boundary. A
    /// truncated header is [`NbxError::FramingCorruption`] and leaves the
    /// reader permanently corrupted.
    pub fn has_next(&mut self) -> Result<bool> {
        match self.state {
            ReaderState::HeaderReady(_) => return Ok(true),
            ReaderState::Finished => return Ok(false),
            ReaderState::Corrupted => {
                return Err(NbxError::FramingCorruption(
                    "frame stream is already corrupted".to_string(),
                ));
            }
            ReaderState::AtBoundary => {}
        }
        if self.pending > 0 {
            return Err(NbxError::ProtocolViolation(format!(
                "previous frame payload not fully consumed: {} bytes left",
                self.pending
            )));
        }

        let mut buf = [0_u8; FRAME_HEADER_LEN];
        let filled = match read_full(&mut self.inner, &mut buf) {
            Ok(n) => n,
            Err(err) => {
                self.state = ReaderState::Corrupted;
                return Err(err.into());
            }
        };
        if filled == 0 {
            self.state = ReaderState::Finished;
            return Ok(false);
        }
        if filled < FRAME_HEADER_LEN {
            self.state = ReaderState::Corrupted;
            return Err(NbxError::FramingCorruption(format!(
                "stream ended {filled} bytes into a {FRAME_HEADER_LEN}-byte frame header"
            )));
        }

        let header = FrameHeader::decode(&buf);
        if header.compressed_len > self.max_frame_bytes {
            self.state = ReaderState::Corrupted;
            return Err(NbxError::FramingCorruption(format!(
                "frame announces {} payload bytes, limit is {}",
                header.compressed_len, self.max_frame_bytes
            )));
        }
        self.state = ReaderState::HeaderReady(header);
        Ok(true)
    }

    /// Hand out the frame announced by the last `has_next`.
    ///
    /// The returned frame must be read to its end (or
    /// [`skip_remaining`](Frame::skip_remaining)) before `has_next` is called
    /// again.
    pub fn next_frame(&mut self) -> Result<Frame<'_, R>> {
        let ReaderState::HeaderReady(header) = self.state else {
            return Err(NbxError::ProtocolViolation(
                "next_frame called without a successful has_next".to_string(),
            ));
        };
        self.state = ReaderState::AtBoundary;
        self.pending = header.compressed_len;
        self.frames += 1;
        Ok(Frame {
            reader: self,
            header,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// One frame whose payload is read lazily from the shared stream.
pub struct Frame<'a, R> {
    reader: &'a mut FrameReader<R>,
    header: FrameHeader,
}

impl<R: Read> Frame<'_, R> {
    pub fn header(&self) -> FrameHeader {
        self.header
    }

    pub fn compressed_len(&self) -> u64 {
        self.header.compressed_len
    }

    pub fn uncompressed_len(&self) -> u64 {
        self.header.uncompressed_len
    }

    /// Payload bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.reader.pending
    }

    /// Discard the unread payload so the next frame can be read.
    pub fn skip_remaining(&mut self) -> Result<u64> {
        let skipped = io::copy(self, &mut io::sink()).map_err(payload_error)?;
        Ok(skipped)
    }

    /// Read the whole payload into memory.
    pub fn read_payload(mut self) -> Result<Vec<u8>> {
        let mut payload =
            Vec::with_capacity(self.reader.pending.min(PAYLOAD_PREALLOC_BYTES) as usize);
        self.read_to_end(&mut payload).map_err(payload_error)?;
        Ok(payload)
    }
}

impl<R: Read> Read for Frame<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reader.pending == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.reader.pending as usize);
        let n = self.reader.inner.read(&mut buf[..max])?;
        if n == 0 {
            self.reader.state = ReaderState::Corrupted;
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "frame payload truncated with {} bytes missing",
                    self.reader.pending
                ),
            ));
        }
        self.reader.pending -= n as u64;
        Ok(n)
    }
}

fn payload_error(err: io::Error) -> NbxError {
    if err.kind() == ErrorKind::UnexpectedEof {
        NbxError::FramingCorruption(err.to_string())
    } else {
        NbxError::Io(err)
    }
}

/// Appends frames to a byte sink.
pub struct FrameWriter<W> {
    inner: W,
    frames: u64,
    bytes: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            frames: 0,
            bytes: 0,
        }
    }

    /// Write one frame and return the bytes it occupies on the stream.
    pub fn write_frame(&mut self, payload: &[u8], uncompressed_len: u64) -> Result<u64> {
        let header = FrameHeader {
            compressed_len: payload.len() as u64,
            uncompressed_len,
        };
        self.inner.write_all(&header.encode())?;
        self.inner.write_all(payload)?;
        let written = (FRAME_HEADER_LEN + payload.len()) as u64;
        self.frames += 1;
        self.bytes += written;
        Ok(written)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn framed(frames: &[(&[u8], u64)]) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new());
        for (payload, uncompressed) in frames {
            writer.write_frame(payload, *uncompressed).expect("write frame");
        }
        writer.into_inner()
    }

    #[test]
    fn two_frames_round_trip_then_end() {
        let bytes = framed(&[(b"first-payload", 40), (b"xy", 9)]);
        let mut reader = FrameReader::new(Cursor::new(bytes), 1024);

        assert!(reader.has_next().expect("first header"));
        // Repeated has_next does not consume another header.
        assert!(reader.has_next().expect("still first"));
        let frame = reader.next_frame().expect("first frame");
        assert_eq!(frame.compressed_len(), 13);
        assert_eq!(frame.uncompressed_len(), 40);
        assert_eq!(frame.read_payload().expect("payload"), b"first-payload");

        assert!(reader.has_next().expect("second header"));
        let frame = reader.next_frame().expect("second frame");
        assert_eq!((frame.compressed_len(), frame.uncompressed_len()), (2, 9));
        assert_eq!(frame.read_payload().expect("payload"), b"xy");

        assert!(!reader.has_next().expect("end"));
        assert!(!reader.has_next().expect("still end"));
        assert_eq!(reader.frames_read(), 2);
    }

    #[test]
    fn empty_stream_has_no_frames() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), 1024);
        assert!(!reader.has_next().expect("end"));
    }

    #[test]
    fn truncated_header_is_corruption() {
        let mut bytes = framed(&[(b"abc", 3)]);
        bytes.truncate(10);
        let mut reader = FrameReader::new(Cursor::new(bytes), 1024);
        let err = reader.has_next().expect_err("partial header");
        assert!(matches!(err, NbxError::FramingCorruption(_)));
        // Corruption is terminal, never a silent end of stream.
        assert!(matches!(
            reader.has_next(),
            Err(NbxError::FramingCorruption(_))
        ));
    }

    #[test]
    fn under_read_payload_blocks_the_next_header() {
        let bytes = framed(&[(b"0123456789", 10), (b"tail", 4)]);
        let mut reader = FrameReader::new(Cursor::new(bytes), 1024);
        assert!(reader.has_next().expect("header"));
        {
            let mut frame = reader.next_frame().expect("frame");
            let mut head = [0_u8; 4];
            frame.read_exact(&mut head).expect("partial read");
            assert_eq!(frame.remaining(), 6);
        }
        let err = reader.has_next().expect_err("under-read");
        assert!(matches!(err, NbxError::ProtocolViolation(_)));
        assert!(matches!(
            reader.next_frame().err(),
            Some(NbxError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn skipping_the_payload_restores_sequencing() {
        let bytes = framed(&[(b"0123456789", 10), (b"tail", 4)]);
        let mut reader = FrameReader::new(Cursor::new(bytes), 1024);
        assert!(reader.has_next().expect("header"));
        let mut frame = reader.next_frame().expect("frame");
        let mut head = [0_u8; 3];
        frame.read_exact(&mut head).expect("partial read");
        assert_eq!(frame.skip_remaining().expect("skip"), 7);

        assert!(reader.has_next().expect("second header"));
        let frame = reader.next_frame().expect("second frame");
        assert_eq!(frame.read_payload().expect("payload"), b"tail");
        assert!(!reader.has_next().expect("end"));
    }

    #[test]
    fn oversized_frame_is_rejected_before_reading_payload() {
        let bytes = framed(&[(&[7_u8; 64], 64)]);
        let mut reader = FrameReader::new(Cursor::new(bytes), 32);
        assert!(matches!(
            reader.has_next(),
            Err(NbxError::FramingCorruption(_))
        ));
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let mut bytes = framed(&[(b"abcdef", 6)]);
        bytes.truncate(FRAME_HEADER_LEN + 3);
        let mut reader = FrameReader::new(Cursor::new(bytes), 1024);
        assert!(reader.has_next().expect("header"));
        let frame = reader.next_frame().expect("frame");
        assert!(matches!(
            frame.read_payload(),
            Err(NbxError::FramingCorruption(_))
        ));
    }

    #[test]
    fn header_announcing_a_huge_payload_fails_on_the_missing_bytes() {
        let header = FrameHeader {
            compressed_len: 1 << 40,
            uncompressed_len: 1 << 40,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(b"short");
        let mut reader = FrameReader::new(Cursor::new(bytes), u64::MAX);
        assert!(reader.has_next().expect("header"));
        let frame = reader.next_frame().expect("frame");
        assert_eq!(frame.remaining(), 1 << 40);
        assert!(matches!(
            frame.read_payload(),
            Err(NbxError::FramingCorruption(_))
        ));
    }
}
