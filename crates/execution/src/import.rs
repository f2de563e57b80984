//! Consumer-side cursor over batches published by a producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, Rows};
use nbx_common::{MemoryReservation, MetricsRegistry, NbxError, Result, TaskId};
use tracing::{debug, warn};

use crate::channel::BatchChannel;
use crate::context::SharedTaskContext;
use crate::descriptor::DescriptorPair;
use crate::producer::ProducerHandle;
use crate::rows::RowLayout;

/// Totals accumulated by one import cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportMetricsSnapshot {
    pub batches: u64,
    pub rows: u64,
    pub bytes: u64,
    pub wait_nanos: u64,
}

#[derive(Debug, Default)]
struct ImportMetrics {
    batches: AtomicU64,
    rows: AtomicU64,
    bytes: AtomicU64,
    wait_nanos: AtomicU64,
}

impl ImportMetrics {
    fn snapshot(&self) -> ImportMetricsSnapshot {
        ImportMetricsSnapshot {
            batches: self.batches.load(Ordering::Acquire),
            rows: self.rows.load(Ordering::Acquire),
            bytes: self.bytes.load(Ordering::Acquire),
            wait_nanos: self.wait_nanos.load(Ordering::Acquire),
        }
    }
}

/// Shutdown state shared with the task completion listener.
struct ImportShutdown {
    task_id: TaskId,
    done: AtomicBool,
    handle: Arc<dyn ProducerHandle>,
    metrics: ImportMetrics,
    reservation: MemoryReservation,
    sink: MetricsRegistry,
}

impl ImportShutdown {
    /// Report metrics, release the producer and free memory. Runs at most once.
    fn shutdown(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        let snapshot = self.metrics.snapshot();
        self.handle.update_metrics(&snapshot);
        self.handle.release();
        self.reservation.free();
        self.sink
            .inc_cursors_closed(&self.task_id.to_string(), "import");
        debug!(
            task_id = %self.task_id,
            batches = snapshot.batches,
            rows = snapshot.rows,
            "import cursor shut down"
        );
        true
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// `current` holds a batch not yet handed out by `next_batch`.
    Ready,
    /// `current` was handed out; the next `has_next` pulls.
    Consumed,
    Finished,
    Failed,
}

/// Lazy, forward-only sequence of batches pulled from a producer.
///
/// The first pull happens eagerly in [`ImportCursor::try_new`]. Each later
/// [`has_next`](Self::has_next) pulls into a fresh descriptor pair and
/// overwrites the cursor's single batch slot.
pub struct ImportCursor {
    channel: Option<BatchChannel>,
    current: Option<RecordBatch>,
    state: CursorState,
    shared: Arc<ImportShutdown>,
    task_label: String,
}

impl ImportCursor {
    pub fn try_new(ctx: &SharedTaskContext, handle: Arc<dyn ProducerHandle>) -> Result<Self> {
        let channel = BatchChannel::open(handle.as_ref(), ctx.config.poll_interval())?;
        let shared = Arc::new(ImportShutdown {
            task_id: ctx.task_id,
            done: AtomicBool::new(false),
            handle,
            metrics: ImportMetrics::default(),
            reservation: ctx
                .memory
                .reserve(format!("import-cursor[task={}]", ctx.task_id)),
            sink: ctx.metrics.clone(),
        });
        let listener = Arc::clone(&shared);
        ctx.add_completion_listener(move |_| {
            listener.shutdown();
        });

        let mut cursor = Self {
            channel: Some(channel),
            current: None,
            state: CursorState::Consumed,
            shared,
            task_label: ctx.task_id.to_string(),
        };
        cursor.pull()?;
        Ok(cursor)
    }

    /// Whether another batch is available, pulling one if the current batch
    /// was already taken.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.shared.is_done() && self.state != CursorState::Failed {
            self.state = CursorState::Finished;
            self.current = None;
            self.channel = None;
        }
        match self.state {
            CursorState::Ready => Ok(true),
            CursorState::Consumed => self.pull(),
            CursorState::Finished => Ok(false),
            CursorState::Failed => Err(NbxError::ProtocolViolation(
                "import cursor already failed".to_string(),
            )),
        }
    }

    /// The batch announced by the last `has_next`.
    pub fn next_batch(&mut self) -> Result<RecordBatch> {
        if self.state != CursorState::Ready {
            return Err(NbxError::ProtocolViolation(
                "next_batch called without a successful has_next".to_string(),
            ));
        }
        let batch = self.current.clone().ok_or_else(|| {
            NbxError::ProtocolViolation("import cursor holds no batch".to_string())
        })?;
        self.state = CursorState::Consumed;
        Ok(batch)
    }

    /// Shut down early. Idempotent; later `has_next` calls return `false`.
    pub fn close(&mut self) {
        self.channel = None;
        self.current = None;
        if self.state != CursorState::Failed {
            self.state = CursorState::Finished;
        }
        self.shared.shutdown();
    }

    pub fn metrics(&self) -> ImportMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Lazy row view; the cursor closes when the rows are drained.
    pub fn into_rows(self, layout: RowLayout) -> ImportRows {
        ImportRows {
            cursor: self,
            layout,
            rows: None,
            pos: 0,
            done: false,
        }
    }

    fn pull(&mut self) -> Result<bool> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(NbxError::ProtocolViolation(
                "import cursor channel already closed".to_string(),
            ));
        };
        let mut pair = DescriptorPair::empty();
        // SAFETY: `pull_one` returns only after the producer answered or failed,
        // so nothing publishes through the handles once `pair` is imported.
        let pulled = channel.pull_one(unsafe { pair.handles() });
        let wait = channel.last_wait();
        self.shared
            .metrics
            .wait_nanos
            .fetch_add(wait.as_nanos() as u64, Ordering::AcqRel);

        let imported = pulled.and_then(|has_batch| {
            if has_batch {
                pair.import().map(Some)
            } else {
                Ok(None)
            }
        });
        match imported {
            Ok(Some(batch)) => {
                let rows = batch.num_rows() as u64;
                let bytes = batch.get_array_memory_size();
                let metrics = &self.shared.metrics;
                metrics.batches.fetch_add(1, Ordering::AcqRel);
                metrics.rows.fetch_add(rows, Ordering::AcqRel);
                metrics.bytes.fetch_add(bytes as u64, Ordering::AcqRel);
                self.shared.sink.record_import_batch(
                    &self.task_label,
                    rows,
                    bytes as u64,
                    wait.as_secs_f64(),
                );
                self.current = Some(batch);
                self.state = CursorState::Ready;
                if let Err(err) = self.shared.reservation.resize(bytes) {
                    self.fail();
                    return Err(err);
                }
                Ok(true)
            }
            Ok(None) => {
                self.close();
                Ok(false)
            }
            Err(err) => {
                if matches!(err, NbxError::ProducerFault(_)) {
                    self.shared.sink.inc_producer_faults(&self.task_label);
                }
                warn!(task_id = %self.task_label, error = %err, "import pull failed");
                self.fail();
                Err(err)
            }
        }
    }

    fn fail(&mut self) {
        self.state = CursorState::Failed;
        self.channel = None;
        self.current = None;
        self.shared.shutdown();
    }
}

impl Iterator for ImportCursor {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == CursorState::Failed {
            return None;
        }
        match self.has_next() {
            Ok(true) => Some(self.next_batch()),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for ImportCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Rows of an [`ImportCursor`], expanded one batch at a time.
pub struct ImportRows {
    cursor: ImportCursor,
    layout: RowLayout,
    rows: Option<Rows>,
    pos: usize,
    done: bool,
}

impl ImportRows {
    pub fn metrics(&self) -> ImportMetricsSnapshot {
        self.cursor.metrics()
    }
}

impl Iterator for ImportRows {
    type Item = Result<OwnedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(rows) = &self.rows {
                if self.pos < rows.num_rows() {
                    let row = rows.row(self.pos).owned();
                    self.pos += 1;
                    return Some(Ok(row));
                }
                self.rows = None;
            }
            match self.cursor.next() {
                Some(Ok(batch)) => match self.layout.to_rows(&batch) {
                    Ok(rows) => {
                        self.rows = Some(rows);
                        self.pos = 0;
                    }
                    Err(err) => {
                        self.done = true;
                        self.cursor.close();
                        return Some(Err(err));
                    }
                },
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    self.cursor.close();
                    return None;
                }
            }
        }
    }
}
