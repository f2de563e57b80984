//! Producer-side contracts for the batch rendezvous.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use futures::StreamExt;
use nbx_common::{NbxError, Result};
use tracing::{debug, info, warn};

use crate::channel::{ProducerEndpoint, ServeOutcome};
use crate::descriptor::DescriptorHandles;
use crate::import::ImportMetricsSnapshot;
use crate::stream::SendableRecordBatchStream;

/// Something that can publish batches, one per call, into foreign descriptors.
pub trait BatchProducer: Send {
    /// Publish the next batch into `handles` and return `Ok(true)`, or return
    /// `Ok(false)` at end of stream without touching them.
    fn produce_next(&mut self, handles: DescriptorHandles) -> Result<bool>;
}

/// Opaque handle to a producer bound to one import cursor.
pub trait ProducerHandle: Send + Sync {
    /// Begin background delivery into `endpoint`. Called exactly once.
    fn start(&self, endpoint: ProducerEndpoint) -> Result<()>;

    /// Receive the consumer's final metrics.
    fn update_metrics(&self, metrics: &ImportMetricsSnapshot);

    /// Release native resources held for the consumer.
    fn release(&self);
}

/// Serves a [`BatchProducer`] from a dedicated delivery thread.
pub struct ThreadedProducer<P> {
    name: String,
    producer: Mutex<Option<P>>,
    thread: Mutex<Option<JoinHandle<ServeOutcome>>>,
    cancel: Arc<AtomicBool>,
    reported: Mutex<Option<ImportMetricsSnapshot>>,
    metric_reports: AtomicUsize,
    releases: AtomicUsize,
}

impl<P> ThreadedProducer<P>
where
    P: BatchProducer + 'static,
{
    pub fn new(name: impl Into<String>, producer: P) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            producer: Mutex::new(Some(producer)),
            thread: Mutex::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
            reported: Mutex::new(None),
            metric_reports: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    /// Last metrics reported by the consumer, if any.
    pub fn reported_metrics(&self) -> Option<ImportMetricsSnapshot> {
        self.reported
            .lock()
            .expect("producer metrics lock poisoned")
            .clone()
    }

    pub fn metric_reports(&self) -> usize {
        self.metric_reports.load(Ordering::Acquire)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Acquire)
    }

    /// Wait for the delivery thread to exit and return how it ended.
    pub fn join(&self) -> Option<ServeOutcome> {
        let handle = self
            .thread
            .lock()
            .expect("producer thread lock poisoned")
            .take()?;
        handle.join().ok()
    }
}

impl<P> ProducerHandle for ThreadedProducer<P>
where
    P: BatchProducer + 'static,
{
    fn start(&self, endpoint: ProducerEndpoint) -> Result<()> {
        let mut producer = self
            .producer
            .lock()
            .expect("producer lock poisoned")
            .take()
            .ok_or_else(|| {
                NbxError::ProtocolViolation(format!("producer '{}' already started", self.name))
            })?;
        let cancel = Arc::clone(&self.cancel);
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("nbx-producer-{}", self.name))
            .spawn(move || {
                debug!(producer = %name, "delivery thread started");
                let outcome = endpoint.serve(&mut producer, &cancel);
                debug!(producer = %name, ?outcome, "delivery thread exited");
                outcome
            })?;
        *self.thread.lock().expect("producer thread lock poisoned") = Some(handle);
        Ok(())
    }

    fn update_metrics(&self, metrics: &ImportMetricsSnapshot) {
        self.metric_reports.fetch_add(1, Ordering::AcqRel);
        *self.reported.lock().expect("producer metrics lock poisoned") = Some(metrics.clone());
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::AcqRel);
        self.cancel.store(true, Ordering::Release);
        let mut thread = self.thread.lock().expect("producer thread lock poisoned");
        if thread.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = thread.take() {
                match handle.join() {
                    Ok(outcome) => info!(producer = %self.name, ?outcome, "producer released"),
                    Err(_) => warn!(producer = %self.name, "producer thread panicked"),
                }
            }
        } else {
            // Still inside `produce_next`; the thread observes `cancel` and exits.
            debug!(producer = %self.name, "producer released while delivering");
        }
    }
}

/// Publishes batches pulled from a native [`SendableRecordBatchStream`].
pub struct StreamProducer {
    stream: SendableRecordBatchStream,
    published: u64,
}

impl StreamProducer {
    pub fn new(stream: SendableRecordBatchStream) -> Self {
        Self {
            stream,
            published: 0,
        }
    }
}

impl BatchProducer for StreamProducer {
    fn produce_next(&mut self, handles: DescriptorHandles) -> Result<bool> {
        match futures::executor::block_on(self.stream.next()) {
            Some(Ok(batch)) => {
                handles.publish(&batch)?;
                self.published += 1;
                Ok(true)
            }
            Some(Err(err)) => Err(err),
            None => {
                debug!(published = self.published, "native stream exhausted");
                Ok(false)
            }
        }
    }
}
