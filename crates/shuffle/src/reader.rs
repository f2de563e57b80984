//! Batches decoded from a framed byte stream.

use std::collections::VecDeque;
use std::io::Read;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use nbx_common::{MetricsRegistry, Result};
use nbx_execution::{SendableRecordBatchStream, iter_stream};
use tracing::{debug, warn};

use crate::codec::FrameCodec;
use crate::frame::{FRAME_HEADER_LEN, FrameReader};

/// Reads frames one at a time and yields the batches each payload holds.
///
/// A frame is fully drained before the next header is read, so the
/// underlying reader is never misaligned.
pub struct FrameBatchReader<R> {
    frames: FrameReader<R>,
    codec: FrameCodec,
    metrics: MetricsRegistry,
    decoded: VecDeque<RecordBatch>,
    done: bool,
}

impl<R: Read> FrameBatchReader<R> {
    pub fn new(frames: FrameReader<R>, codec: FrameCodec, metrics: MetricsRegistry) -> Self {
        Self {
            frames,
            codec,
            metrics,
            decoded: VecDeque::new(),
            done: false,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames.frames_read()
    }

    /// Decode the next frame into `decoded`. `Ok(false)` at end of stream.
    fn read_frame(&mut self) -> Result<bool> {
        if !self.frames.has_next()? {
            return Ok(false);
        }
        let frame = self.frames.next_frame()?;
        let header = frame.header();
        let payload = frame.read_payload()?;
        let batches = self.codec.decode(&payload, header.uncompressed_len)?;
        self.metrics.record_frame_read(
            self.codec.mode().as_str(),
            FRAME_HEADER_LEN as u64 + header.compressed_len,
        );
        debug!(
            frame = self.frames.frames_read(),
            compressed = header.compressed_len,
            uncompressed = header.uncompressed_len,
            batches = batches.len(),
            "frame decoded"
        );
        self.decoded.extend(batches);
        Ok(true)
    }

    /// Adapt to the native stream interface.
    pub fn into_stream(self, schema: SchemaRef) -> SendableRecordBatchStream
    where
        R: Send + Unpin + 'static,
    {
        iter_stream(schema, self)
    }
}

impl<R: Read> Iterator for FrameBatchReader<R> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = self.decoded.pop_front() {
                return Some(Ok(batch));
            }
            if self.done {
                return None;
            }
            match self.read_frame() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    warn!(error = %err, frames = self.frames.frames_read(), "frame stream failed");
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
