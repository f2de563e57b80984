//! Batches encoded onto a framed byte stream.

use std::io::Write;

use arrow::record_batch::RecordBatch;
use nbx_common::{MetricsRegistry, Result};

use crate::codec::FrameCodec;
use crate::frame::FrameWriter;

pub struct FrameBatchWriter<W> {
    frames: FrameWriter<W>,
    codec: FrameCodec,
    metrics: MetricsRegistry,
}

impl<W: Write> FrameBatchWriter<W> {
    pub fn new(inner: W, codec: FrameCodec, metrics: MetricsRegistry) -> Self {
        Self {
            frames: FrameWriter::new(inner),
            codec,
            metrics,
        }
    }

    /// Encode `batches` as one frame. Returns the bytes written.
    pub fn write_batches(&mut self, batches: &[RecordBatch]) -> Result<u64> {
        let encoded = self.codec.encode(batches)?;
        let written = self
            .frames
            .write_frame(&encoded.payload, encoded.uncompressed_len)?;
        self.metrics
            .record_frame_written(self.codec.mode().as_str(), written);
        Ok(written)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames.frames_written()
    }

    pub fn finish(mut self) -> Result<W> {
        self.frames.flush()?;
        Ok(self.frames.into_inner())
    }
}
