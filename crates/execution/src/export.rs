//! Producer-side cursor: rows in, exportable batches out.

use std::iter::Peekable;
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use arrow::row::OwnedRow;
use nbx_common::{MemoryReservation, MetricsRegistry, NbxError, Result, TaskId};
use tracing::{debug, warn};

use crate::context::SharedTaskContext;
use crate::descriptor::DescriptorHandles;
use crate::producer::BatchProducer;
use crate::rows::RowLayout;

/// The finalized batch most recently built by an export cursor.
struct ExportSlot {
    batch: Option<RecordBatch>,
    generation: u64,
    reservation: MemoryReservation,
}

struct ExportShared {
    task_id: TaskId,
    slot: Mutex<Option<ExportSlot>>,
    sink: MetricsRegistry,
}

impl ExportShared {
    /// Free the batch and its reservation. Runs at most once.
    fn close(&self) -> bool {
        let taken = self
            .slot
            .lock()
            .expect("export slot lock poisoned")
            .take();
        let Some(slot) = taken else {
            return false;
        };
        slot.reservation.free();
        self.sink
            .inc_cursors_closed(&self.task_id.to_string(), "export");
        debug!(
            task_id = %self.task_id,
            batches = slot.generation,
            "export cursor closed"
        );
        true
    }

    fn is_closed(&self) -> bool {
        self.slot
            .lock()
            .expect("export slot lock poisoned")
            .is_none()
    }
}

/// Batches a lazy row sequence into exportable batches of at most
/// `record_batch_size` rows.
pub struct ExportCursor<I>
where
    I: Iterator<Item = Result<OwnedRow>>,
{
    rows: Peekable<I>,
    layout: RowLayout,
    record_batch_size: usize,
    buffer: Vec<OwnedRow>,
    shared: Arc<ExportShared>,
    task_label: String,
    failed: bool,
}

impl<I> ExportCursor<I>
where
    I: Iterator<Item = Result<OwnedRow>>,
{
    pub fn try_new(ctx: &SharedTaskContext, layout: RowLayout, rows: I) -> Result<Self> {
        let record_batch_size = ctx.config.record_batch_size;
        if record_batch_size == 0 {
            return Err(NbxError::InvalidConfig(
                "record_batch_size must be positive".to_string(),
            ));
        }
        let shared = Arc::new(ExportShared {
            task_id: ctx.task_id,
            slot: Mutex::new(Some(ExportSlot {
                batch: None,
                generation: 0,
                reservation: ctx
                    .memory
                    .reserve(format!("export-cursor[task={}]", ctx.task_id)),
            })),
            sink: ctx.metrics.clone(),
        });
        let listener = Arc::clone(&shared);
        ctx.add_completion_listener(move |_| {
            listener.close();
        });
        Ok(Self {
            rows: rows.peekable(),
            layout,
            record_batch_size,
            buffer: Vec::with_capacity(record_batch_size),
            shared,
            task_label: ctx.task_id.to_string(),
            failed: false,
        })
    }

    pub fn with_record_batch_size(mut self, rows: usize) -> Self {
        self.record_batch_size = rows.max(1);
        self
    }

    pub fn record_batch_size(&self) -> usize {
        self.record_batch_size
    }

    /// True while input rows remain and the cursor is open.
    pub fn has_next(&mut self) -> bool {
        !self.shared.is_closed() && self.rows.peek().is_some()
    }

    /// Finalize the next batch and return the operation that publishes it.
    ///
    /// The returned [`ExportBatch`] must be invoked before the next call to
    /// `next_export`; a stale one fails with a protocol violation.
    pub fn next_export(&mut self) -> Result<ExportBatch> {
        if self.failed {
            return Err(NbxError::ProtocolViolation(
                "export cursor failed on an earlier batch".to_string(),
            ));
        }
        if self.shared.is_closed() {
            return Err(NbxError::ProtocolViolation(
                "export cursor is closed".to_string(),
            ));
        }
        self.buffer.clear();
        while self.buffer.len() < self.record_batch_size {
            match self.rows.next() {
                Some(Ok(row)) => self.buffer.push(row),
                Some(Err(err)) => return Err(self.fail(err)),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return Err(NbxError::ProtocolViolation(
                "next_export called on an exhausted export cursor".to_string(),
            ));
        }

        let batch = match self.layout.to_batch(self.buffer.iter().map(|r| r.row())) {
            Ok(batch) => batch,
            Err(err) => return Err(self.fail(err)),
        };
        let rows = batch.num_rows();
        let bytes = batch.get_array_memory_size();

        let stored = {
            let mut guard = self.shared.slot.lock().expect("export slot lock poisoned");
            match guard.as_mut() {
                None => Err(NbxError::ProtocolViolation(
                    "export cursor closed while building a batch".to_string(),
                )),
                Some(slot) => slot.reservation.resize(bytes).map(|()| {
                    slot.batch = Some(batch);
                    slot.generation += 1;
                    slot.generation
                }),
            }
        };
        let generation = match stored {
            Ok(generation) => generation,
            Err(err) => return Err(self.fail(err)),
        };

        self.shared.sink.record_export_batch(&self.task_label, rows as u64);
        Ok(ExportBatch {
            shared: Arc::clone(&self.shared),
            generation,
            num_rows: rows,
        })
    }

    /// A batch that cannot be built ends the cursor: later calls fail and the
    /// rows already drawn are not retried.
    fn fail(&mut self, err: NbxError) -> NbxError {
        warn!(task_id = %self.task_label, error = %err, "export cursor failed");
        self.failed = true;
        self.close();
        err
    }

    /// Release the buffer and its reservation. Idempotent.
    pub fn close(&mut self) {
        self.buffer.clear();
        self.shared.close();
    }
}

impl<I> Drop for ExportCursor<I>
where
    I: Iterator<Item = Result<OwnedRow>>,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<I> BatchProducer for ExportCursor<I>
where
    I: Iterator<Item = Result<OwnedRow>> + Send,
{
    fn produce_next(&mut self, handles: DescriptorHandles) -> Result<bool> {
        if !self.has_next() {
            return Ok(false);
        }
        self.next_export()?.export(handles)?;
        Ok(true)
    }
}

/// Single-use operation publishing one finalized batch.
#[must_use = "an export does nothing until invoked with destination descriptors"]
pub struct ExportBatch {
    shared: Arc<ExportShared>,
    generation: u64,
    num_rows: usize,
}

impl ExportBatch {
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Publish the batch's schema and data into `handles`.
    pub fn export(self, handles: DescriptorHandles) -> Result<()> {
        let guard = self.shared.slot.lock().expect("export slot lock poisoned");
        let Some(slot) = guard.as_ref() else {
            return Err(NbxError::ProtocolViolation(
                "export invoked after the cursor was closed".to_string(),
            ));
        };
        if slot.generation != self.generation {
            return Err(NbxError::ProtocolViolation(format!(
                "stale export: batch {} was overwritten by batch {}",
                self.generation, slot.generation
            )));
        }
        let batch = slot.batch.as_ref().ok_or_else(|| {
            NbxError::ProtocolViolation("export slot holds no batch".to_string())
        })?;
        handles.publish(batch)
    }
}
