//! Row view over columnar batches.
//!
//! The managed side consumes and produces rows in the Arrow row format.
//! A [`RowLayout`] is shared (cheaply cloned) by every cursor that exchanges
//! rows of one schema; rows are only convertible back by the layout that
//! produced them.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow::row::{Row, RowConverter, Rows, SortField};
use arrow_schema::SchemaRef;
use nbx_common::{NbxError, Result};

#[derive(Debug, Clone)]
pub struct RowLayout {
    schema: SchemaRef,
    converter: Arc<RowConverter>,
}

impl RowLayout {
    pub fn try_new(schema: SchemaRef) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| SortField::new(f.data_type().clone()))
            .collect::<Vec<_>>();
        let converter = RowConverter::new(fields)
            .map_err(|e| NbxError::Execution(format!("row layout init failed: {e}")))?;
        Ok(Self {
            schema,
            converter: Arc::new(converter),
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Expand `batch` into rows.
    pub fn to_rows(&self, batch: &RecordBatch) -> Result<Rows> {
        self.converter
            .convert_columns(batch.columns())
            .map_err(|e| NbxError::Execution(format!("row conversion failed: {e}")))
    }

    /// Build one batch of this layout's schema from `rows`.
    pub fn to_batch<'a, I>(&self, rows: I) -> Result<RecordBatch>
    where
        I: IntoIterator<Item = Row<'a>>,
    {
        let columns = self
            .converter
            .convert_rows(rows)
            .map_err(|e| NbxError::Execution(format!("row decode failed: {e}")))?;
        RecordBatch::try_new(self.schema.clone(), columns)
            .map_err(|e| NbxError::Execution(format!("batch assembly failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Float64Array, Int32Array};
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn rows_round_trip_through_layout() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, false),
            Field::new("v", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int32Array::from(vec![3, 1, 2])),
                Arc::new(Float64Array::from(vec![Some(0.5), None, Some(2.0)])),
            ],
        )
        .expect("batch");

        let layout = RowLayout::try_new(schema).expect("layout");
        let rows = layout.to_rows(&batch).expect("rows");
        assert_eq!(rows.num_rows(), 3);
        let owned = rows.iter().map(|r| r.owned()).collect::<Vec<_>>();
        let rebuilt = layout
            .to_batch(owned.iter().map(|r| r.row()))
            .expect("rebuild");
        assert_eq!(rebuilt, batch);
    }
}
