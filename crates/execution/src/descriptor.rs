//! Arrow C Data Interface descriptor pairs.
//!
//! One batch crosses the ownership boundary through a pair of descriptors: an
//! `FFI_ArrowSchema` for its (struct) type and an `FFI_ArrowArray` for its
//! data. The importer owns a [`DescriptorPair`] for the duration of a single
//! exchange; the producer only ever sees the raw [`DescriptorHandles`].

use std::ptr;

use arrow::array::{Array, StructArray};
use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema, from_ffi, to_ffi};
use arrow::record_batch::RecordBatch;
use nbx_common::{NbxError, Result};

/// Empty schema/array descriptors at stable heap addresses.
pub struct DescriptorPair {
    schema: Box<FFI_ArrowSchema>,
    array: Box<FFI_ArrowArray>,
}

impl DescriptorPair {
    pub fn empty() -> Self {
        Self {
            schema: Box::new(FFI_ArrowSchema::empty()),
            array: Box::new(FFI_ArrowArray::empty()),
        }
    }

    /// Raw handles a producer publishes into.
    ///
    /// # Safety
    /// The handles must not be published through after `self` is dropped or
    /// consumed by [`import`](Self::import). The descriptors are boxed, so
    /// moving the pair itself does not invalidate them.
    pub unsafe fn handles(&mut self) -> DescriptorHandles {
        DescriptorHandles {
            schema: ptr::addr_of_mut!(*self.schema),
            array: ptr::addr_of_mut!(*self.array),
        }
    }

    pub fn is_populated(&self) -> bool {
        !self.array.is_released()
    }

    /// Take ownership of the published batch.
    ///
    /// Buffers are not copied; the producer's release callback runs when the
    /// last reference to the returned batch is dropped.
    pub fn import(self) -> Result<RecordBatch> {
        if !self.is_populated() {
            return Err(NbxError::ProtocolViolation(
                "producer signalled a batch but left the array descriptor empty".to_string(),
            ));
        }
        let DescriptorPair { schema, array } = self;
        // SAFETY: the producer populated both descriptors following the C data
        // interface before answering the pull, and nothing else aliases them.
        let data = unsafe { from_ffi(*array, &schema) }
            .map_err(|e| NbxError::Execution(format!("ffi import failed: {e}")))?;
        Ok(RecordBatch::from(StructArray::from(data)))
    }
}

impl Default for DescriptorPair {
    fn default() -> Self {
        Self::empty()
    }
}

/// Destination pointers for one exchange.
///
/// Handles are single-writer: exactly one producer publishes into them, once.
#[derive(Debug)]
pub struct DescriptorHandles {
    schema: *mut FFI_ArrowSchema,
    array: *mut FFI_ArrowArray,
}

// SAFETY: handles are moved to exactly one producer thread per exchange and the
// importer does not touch the pointees until the producer has answered.
unsafe impl Send for DescriptorHandles {}

impl DescriptorHandles {
    /// Wrap foreign-owned descriptors.
    ///
    /// # Safety
    /// Both pointers must be non-null, properly aligned, point to released
    /// (empty) descriptors, and stay valid until [`publish`](Self::publish)
    /// returns.
    pub unsafe fn from_raw(schema: *mut FFI_ArrowSchema, array: *mut FFI_ArrowArray) -> Self {
        Self { schema, array }
    }

    /// Publish `batch` into the destination descriptors without copying buffers.
    pub fn publish(self, batch: &RecordBatch) -> Result<()> {
        if self.schema.is_null() || self.array.is_null() {
            return Err(NbxError::ProtocolViolation(
                "descriptor handles must be non-null".to_string(),
            ));
        }
        // SAFETY: non-null, and valid for reads per the `from_raw` / `handles` contract.
        if !unsafe { (*self.array).is_released() } {
            return Err(NbxError::ProtocolViolation(
                "destination descriptors already hold a batch".to_string(),
            ));
        }
        let data = StructArray::from(batch.clone()).into_data();
        let (array, schema) =
            to_ffi(&data).map_err(|e| NbxError::Execution(format!("ffi export failed: {e}")))?;
        // SAFETY: pointers are non-null and valid, and the array was checked to
        // be released above, so overwriting without drop leaks nothing.
        unsafe {
            ptr::write(self.schema, schema);
            ptr::write(self.array, array);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::Arc;

    use arrow::alloc::Allocation;
    use arrow::array::{Int64Array, StringArray};
    use arrow::buffer::{Buffer, ScalarBuffer};
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn publish_then_import_shares_buffers() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1_i64, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])),
            ],
        )
        .expect("batch");

        let mut pair = DescriptorPair::empty();
        assert!(!pair.is_populated());
        // SAFETY: `pair` outlives the publish.
        unsafe { pair.handles() }.publish(&batch).expect("publish");
        assert!(pair.is_populated());

        let imported = pair.import().expect("import");
        assert_eq!(imported.schema(), schema);
        assert_eq!(imported, batch);
        let ids = imported
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        let original = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        assert_eq!(ids.values().as_ptr(), original.values().as_ptr());
    }

    #[test]
    fn second_publish_into_a_populated_pair_is_rejected() {
        let owner = Arc::new(vec![1_i64, 2, 3]);
        // SAFETY: the buffer points into `owner`'s heap allocation, which the
        // buffer keeps alive through the clone it holds.
        let buffer = unsafe {
            Buffer::from_custom_allocation(
                NonNull::new(owner.as_ptr().cast::<u8>().cast_mut()).expect("non-null"),
                owner.len() * std::mem::size_of::<i64>(),
                owner.clone() as Arc<dyn Allocation>,
            )
        };
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::new(ScalarBuffer::new(buffer, 0, 3), None))],
        )
        .expect("batch");
        assert_eq!(Arc::strong_count(&owner), 2);

        let mut pair = DescriptorPair::empty();
        // SAFETY: `pair` outlives both publishes.
        unsafe { pair.handles() }.publish(&batch).expect("first publish");
        let err = unsafe { pair.handles() }
            .publish(&batch)
            .expect_err("populated");
        assert!(matches!(err, NbxError::ProtocolViolation(_)));

        let imported = pair.import().expect("import");
        assert_eq!(imported, batch);
        drop(imported);
        drop(batch);
        // Every exported array was released back to its owner.
        assert_eq!(Arc::strong_count(&owner), 1);
    }

    #[test]
    fn importing_unpopulated_pair_is_a_protocol_violation() {
        let err = DescriptorPair::empty().import().expect_err("empty");
        assert!(matches!(err, NbxError::ProtocolViolation(_)));
    }
}
