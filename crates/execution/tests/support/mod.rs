#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use nbx_common::{BridgeConfig, NbxError, Result, TaskId};
use nbx_execution::{
    BatchProducer, DescriptorHandles, SharedTaskContext, StreamProducer, TaskContext,
    ThreadedProducer, iter_stream,
};

pub fn fast_config() -> BridgeConfig {
    BridgeConfig {
        poll_interval_ms: 10,
        ..BridgeConfig::default()
    }
}

pub fn task(id: u64) -> SharedTaskContext {
    TaskContext::standalone(TaskId(id), fast_config())
}

pub fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("tag", DataType::Utf8, true),
    ]))
}

/// Batch of `rows` rows whose ids start at `start`.
pub fn batch(start: i64, rows: usize) -> RecordBatch {
    let ids = (start..start + rows as i64).collect::<Vec<_>>();
    let tags = ids
        .iter()
        .map(|i| (i % 3 != 0).then(|| format!("t{i}")))
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(tags)),
        ],
    )
    .expect("batch")
}

pub fn ids(batch: &RecordBatch) -> Vec<i64> {
    batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 ids")
        .values()
        .to_vec()
}

/// Producer over a fixed script of batches and failures.
pub fn scripted(
    name: &str,
    items: Vec<Result<RecordBatch>>,
) -> Arc<ThreadedProducer<StreamProducer>> {
    let stream = iter_stream(schema(), items);
    ThreadedProducer::new(name, StreamProducer::new(stream))
}

pub fn batches(sizes: &[usize]) -> Vec<Result<RecordBatch>> {
    let mut start = 0_i64;
    sizes
        .iter()
        .map(|&rows| {
            let b = batch(start, rows);
            start += rows as i64;
            Ok(b)
        })
        .collect()
}

/// Panics on the call after `ok_batches` successful publishes.
pub struct PanickingProducer {
    pub ok_batches: usize,
    pub published: usize,
}

impl BatchProducer for PanickingProducer {
    fn produce_next(&mut self, handles: DescriptorHandles) -> Result<bool> {
        if self.published == self.ok_batches {
            panic!("native engine crashed");
        }
        handles.publish(&batch(self.published as i64 * 10, 10))?;
        self.published += 1;
        Ok(true)
    }
}

pub fn native_error(msg: &str) -> NbxError {
    NbxError::Execution(msg.to_string())
}
