use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::row::OwnedRow;
use nbx_common::{
    BridgeConfig, MemoryPool, MetricsRegistry, NbxError, PartitionId, Result, TaskId,
};
use nbx_execution::{
    ExportCursor, ImportCursor, ProducerHandle, RowLayout, SendableRecordBatchStream,
    SharedTaskContext, StreamProducer, TaskContext, ThreadedProducer,
};
use nbx_shuffle::{
    FrameBatchReader, FrameBatchWriter, FrameCodec, FrameReader, Segment, SegmentSource,
    SegmentedBatchReader,
};
use tracing::info;

struct BridgeState {
    config: BridgeConfig,
    memory: Arc<MemoryPool>,
    metrics: MetricsRegistry,
    next_task: AtomicU64,
}

/// Entry point for exchanging batches with a native engine.
///
/// Tasks created by one bridge share its memory pool and metrics registry.
#[derive(Clone)]
pub struct Bridge {
    state: Arc<BridgeState>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        if config.record_batch_size == 0 {
            return Err(NbxError::InvalidConfig(
                "record_batch_size must be positive".to_string(),
            ));
        }
        if config.poll_interval_ms == 0 {
            return Err(NbxError::InvalidConfig(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        info!(
            record_batch_size = config.record_batch_size,
            read_mode = config.read_mode.as_str(),
            "bridge created"
        );
        Ok(Self {
            state: Arc::new(BridgeState {
                memory: MemoryPool::new(config.mem_budget_bytes),
                config,
                metrics: MetricsRegistry::new(),
                next_task: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.state.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.state.metrics
    }

    pub fn memory(&self) -> &Arc<MemoryPool> {
        &self.state.memory
    }

    pub fn prometheus_metrics(&self) -> String {
        self.state.metrics.render_prometheus()
    }

    /// Context for a new task; complete it to release every cursor it owns.
    pub fn new_task(&self, partition: PartitionId) -> SharedTaskContext {
        let id = TaskId(self.state.next_task.fetch_add(1, Ordering::AcqRel));
        TaskContext::new(
            id,
            partition,
            self.state.config.clone(),
            Arc::clone(&self.state.memory),
            self.state.metrics.clone(),
        )
    }

    pub fn import(
        &self,
        ctx: &SharedTaskContext,
        handle: Arc<dyn ProducerHandle>,
    ) -> Result<ImportCursor> {
        ImportCursor::try_new(ctx, handle)
    }

    /// Import the batches of a native stream, delivered from a background thread.
    pub fn import_stream(
        &self,
        ctx: &SharedTaskContext,
        stream: SendableRecordBatchStream,
    ) -> Result<ImportCursor> {
        let name = format!("task-{}", ctx.task_id);
        let handle = ThreadedProducer::new(name, StreamProducer::new(stream));
        ImportCursor::try_new(ctx, handle)
    }

    pub fn export<I>(
        &self,
        ctx: &SharedTaskContext,
        layout: RowLayout,
        rows: I,
    ) -> Result<ExportCursor<I>>
    where
        I: Iterator<Item = Result<OwnedRow>>,
    {
        ExportCursor::try_new(ctx, layout, rows)
    }

    pub fn read_frames<R: Read>(&self, reader: R) -> FrameBatchReader<R> {
        FrameBatchReader::new(
            FrameReader::new(reader, self.state.config.max_frame_bytes),
            FrameCodec::from_config(&self.state.config),
            self.state.metrics.clone(),
        )
    }

    pub fn write_frames<W: Write>(&self, writer: W) -> FrameBatchWriter<W> {
        FrameBatchWriter::new(
            writer,
            FrameCodec::from_config(&self.state.config),
            self.state.metrics.clone(),
        )
    }

    pub fn read_file_segment(
        &self,
        path: impl AsRef<Path>,
        offset: u64,
        length: u64,
    ) -> Result<FrameBatchReader<SegmentSource>> {
        nbx_shuffle::read_file_segment(
            path,
            offset,
            length,
            &self.state.config,
            self.state.metrics.clone(),
        )
    }

    /// Batches of `segments` read in order, for inputs split across open
    /// streams and stored file ranges.
    pub fn read_segments<I>(&self, segments: I) -> SegmentedBatchReader<I::IntoIter>
    where
        I: IntoIterator<Item = Segment>,
    {
        SegmentedBatchReader::new(segments, &self.state.config, self.state.metrics.clone())
    }
}
