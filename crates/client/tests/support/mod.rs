#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{Float64Array, Int32Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::row::OwnedRow;
use nbx_client::{Bridge, BridgeConfig, RowLayout};

pub fn bridge(record_batch_size: usize) -> Bridge {
    Bridge::new(BridgeConfig {
        record_batch_size,
        poll_interval_ms: 10,
        ..BridgeConfig::default()
    })
    .expect("bridge")
}

pub fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int32, false),
        Field::new("score", DataType::Float64, true),
    ]))
}

pub fn batch(start: i32, rows: usize) -> RecordBatch {
    let keys = (start..start + rows as i32).collect::<Vec<_>>();
    let scores = keys
        .iter()
        .map(|k| (k % 4 != 0).then_some(*k as f64 / 2.0))
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int32Array::from(keys)),
            Arc::new(Float64Array::from(scores)),
        ],
    )
    .expect("batch")
}

pub fn owned_rows(layout: &RowLayout, batch: &RecordBatch) -> Vec<OwnedRow> {
    layout
        .to_rows(batch)
        .expect("rows")
        .iter()
        .map(|r| r.owned())
        .collect()
}
