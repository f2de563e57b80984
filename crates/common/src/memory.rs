//! Memory accounting for batches held by exchange cursors.
//!
//! A [`MemoryPool`] is shared by every cursor of a bridge. Each cursor owns
//! one [`MemoryReservation`] that it resizes to the footprint of the batch it
//! currently holds, and frees exactly once when it shuts down.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{NbxError, Result};

const FREED: usize = usize::MAX;

/// Shared budget for all reservations created from it.
#[derive(Debug)]
pub struct MemoryPool {
    budget_bytes: usize,
    in_use_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl MemoryPool {
    /// Create a pool; `usize::MAX` means unbounded.
    #[must_use]
    pub fn new(budget_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            budget_bytes,
            in_use_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        })
    }

    /// Open an empty reservation owned by `consumer`.
    #[must_use]
    pub fn reserve(self: &Arc<Self>, consumer: impl Into<String>) -> MemoryReservation {
        MemoryReservation {
            pool: Arc::clone(self),
            consumer: consumer.into(),
            reserved_bytes: AtomicUsize::new(0),
        }
    }

    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Acquire)
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    fn try_grow(&self, consumer: &str, bytes: usize) -> Result<()> {
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if next > self.budget_bytes {
                return Err(NbxError::ResourcesExhausted(format!(
                    "{consumer} requested {bytes} bytes with {current} of {} in use",
                    self.budget_bytes
                )));
            }
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.peak_bytes.fetch_max(next, Ordering::AcqRel);
                return Ok(());
            }
        }
    }

    fn shrink(&self, bytes: usize) {
        if bytes > 0 {
            self.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

/// Bytes held against a [`MemoryPool`] by one consumer.
///
/// `free` is idempotent and may race with `resize` from another thread; once
/// freed the reservation stays empty and later resizes are no-ops.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<MemoryPool>,
    consumer: String,
    reserved_bytes: AtomicUsize,
}

impl MemoryReservation {
    /// Set the reservation to exactly `bytes`.
    pub fn resize(&self, bytes: usize) -> Result<()> {
        loop {
            let current = self.reserved_bytes.load(Ordering::Acquire);
            if current == FREED {
                return Ok(());
            }
            if bytes > current {
                self.pool.try_grow(&self.consumer, bytes - current)?;
            }
            if self
                .reserved_bytes
                .compare_exchange(current, bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if bytes < current {
                    self.pool.shrink(current - bytes);
                }
                return Ok(());
            }
            if bytes > current {
                self.pool.shrink(bytes - current);
            }
        }
    }

    /// Return all bytes to the pool. Returns `false` if already freed.
    pub fn free(&self) -> bool {
        let held = self.reserved_bytes.swap(FREED, Ordering::AcqRel);
        if held == FREED {
            return false;
        }
        self.pool.shrink(held);
        true
    }

    pub fn size(&self) -> usize {
        match self.reserved_bytes.load(Ordering::Acquire) {
            FREED => 0,
            n => n,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}
