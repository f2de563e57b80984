//! Cross-thread rendezvous between a batch consumer and its producer.
//!
//! A pull is a two-step handshake over one zero-capacity channel: the
//! consumer hands over a [`Handoff::Request`] carrying empty descriptors, then
//! waits for the producer's [`Handoff::Done`] on the same channel. Both steps
//! wait in bounded slices; between slices the consumer polls a separate fault
//! channel so a dead producer fails the pull instead of hanging it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};
use nbx_common::{NbxError, Result};
use tracing::{debug, warn};

use crate::descriptor::DescriptorHandles;
use crate::producer::{BatchProducer, ProducerHandle};

/// Message exchanged in either direction over the handoff channel.
#[derive(Debug)]
pub enum Handoff {
    /// Consumer to producer: publish the next batch into these descriptors.
    Request(DescriptorHandles),
    /// Producer to consumer: `true` if a batch was published, `false` at end of stream.
    Done(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Open,
    Finished,
    Failed,
}

/// Consumer side of the rendezvous.
pub struct BatchChannel {
    handoff_tx: Sender<Handoff>,
    handoff_rx: Receiver<Handoff>,
    faults: Receiver<NbxError>,
    consumer_closed: Arc<AtomicBool>,
    poll_interval: Duration,
    state: ChannelState,
    last_wait: Duration,
}

impl BatchChannel {
    /// Bind a channel to `handle` and start its background delivery.
    pub fn open(handle: &dyn ProducerHandle, poll_interval: Duration) -> Result<Self> {
        let (handoff_tx, handoff_rx) = bounded::<Handoff>(0);
        let (fault_tx, faults) = bounded::<NbxError>(1);
        let consumer_closed = Arc::new(AtomicBool::new(false));
        let endpoint = ProducerEndpoint {
            handoff_tx: handoff_tx.clone(),
            handoff_rx: handoff_rx.clone(),
            faults: fault_tx,
            consumer_closed: Arc::clone(&consumer_closed),
            poll_interval,
        };
        handle.start(endpoint)?;
        Ok(Self {
            handoff_tx,
            handoff_rx,
            faults,
            consumer_closed,
            poll_interval,
            state: ChannelState::Open,
            last_wait: Duration::ZERO,
        })
    }

    /// Block until the producer publishes a batch into `handles` (`Ok(true)`),
    /// reports end of stream (`Ok(false)`), or fails (`Err`).
    ///
    /// `handles` must stay valid until this call returns. After `Ok(false)` or
    /// an error the channel is terminal and further pulls are protocol
    /// violations.
    pub fn pull_one(&mut self, handles: DescriptorHandles) -> Result<bool> {
        match self.state {
            ChannelState::Open => {}
            ChannelState::Finished => {
                return Err(NbxError::ProtocolViolation(
                    "pull after end of stream".to_string(),
                ));
            }
            ChannelState::Failed => {
                return Err(NbxError::ProtocolViolation(
                    "pull after producer fault".to_string(),
                ));
            }
        }
        let started = Instant::now();
        let result = self.request(handles).and_then(|()| self.await_done());
        self.last_wait = started.elapsed();
        match &result {
            Ok(true) => {}
            Ok(false) => self.state = ChannelState::Finished,
            Err(_) => self.state = ChannelState::Failed,
        }
        result
    }

    /// Time the most recent pull spent blocked.
    pub fn last_wait(&self) -> Duration {
        self.last_wait
    }

    fn request(&self, handles: DescriptorHandles) -> Result<()> {
        let mut msg = Handoff::Request(handles);
        loop {
            match self.handoff_tx.send_timeout(msg, self.poll_interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    self.check_fault()?;
                    msg = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(self.take_fault().unwrap_or_else(|| {
                        NbxError::ProducerFault("handoff channel disconnected".to_string())
                    }));
                }
            }
        }
    }

    fn await_done(&self) -> Result<bool> {
        loop {
            match self.handoff_rx.recv_timeout(self.poll_interval) {
                Ok(Handoff::Done(has_batch)) => return Ok(has_batch),
                Ok(Handoff::Request(_)) => {
                    return Err(NbxError::ProtocolViolation(
                        "consumer received a request on the handoff channel".to_string(),
                    ));
                }
                Err(RecvTimeoutError::Timeout) => self.check_fault()?,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.take_fault().unwrap_or_else(|| {
                        NbxError::ProducerFault("handoff channel disconnected".to_string())
                    }));
                }
            }
        }
    }

    fn check_fault(&self) -> Result<()> {
        match self.take_fault() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn take_fault(&self) -> Option<NbxError> {
        match self.faults.try_recv() {
            Ok(err) => Some(as_producer_fault(err)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(NbxError::ProducerFault(
                "producer exited without answering".to_string(),
            )),
        }
    }
}

impl Drop for BatchChannel {
    fn drop(&mut self) {
        self.consumer_closed.store(true, Ordering::Release);
    }
}

fn as_producer_fault(err: NbxError) -> NbxError {
    match err {
        NbxError::ProducerFault(_) => err,
        other => NbxError::ProducerFault(other.to_string()),
    }
}

/// Producer side of the rendezvous, handed to [`ProducerHandle::start`].
pub struct ProducerEndpoint {
    handoff_tx: Sender<Handoff>,
    handoff_rx: Receiver<Handoff>,
    faults: Sender<NbxError>,
    consumer_closed: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl ProducerEndpoint {
    /// Answer pull requests with `producer` until end of stream, a fault, the
    /// consumer going away, or `cancel` being set.
    ///
    /// Errors and panics raised by the producer are posted on the fault
    /// channel; they are never returned to the serving thread.
    pub fn serve<P>(self, producer: &mut P, cancel: &AtomicBool) -> ServeOutcome
    where
        P: BatchProducer + ?Sized,
    {
        let mut delivered = 0_u64;
        loop {
            let Some(handles) = self.next_request(cancel) else {
                debug!(delivered, "producer endpoint stopped: consumer gone or cancelled");
                return ServeOutcome::Abandoned { delivered };
            };
            let produced = catch_unwind(AssertUnwindSafe(|| producer.produce_next(handles)))
                .unwrap_or_else(|_| {
                    Err(NbxError::ProducerFault(
                        "producer panicked while publishing a batch".to_string(),
                    ))
                });
            match produced {
                Ok(has_batch) => {
                    if !self.answer(has_batch, cancel) {
                        return ServeOutcome::Abandoned { delivered };
                    }
                    if !has_batch {
                        return ServeOutcome::Finished { delivered };
                    }
                    delivered += 1;
                }
                Err(err) => {
                    warn!(delivered, error = %err, "producer failed");
                    let message = err.to_string();
                    match self.faults.try_send(err) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => {
                            debug!("fault dropped: consumer already gone");
                        }
                    }
                    return ServeOutcome::Failed { delivered, message };
                }
            }
        }
    }

    fn stopped(&self, cancel: &AtomicBool) -> bool {
        cancel.load(Ordering::Acquire) || self.consumer_closed.load(Ordering::Acquire)
    }

    fn next_request(&self, cancel: &AtomicBool) -> Option<DescriptorHandles> {
        loop {
            if self.stopped(cancel) {
                return None;
            }
            match self.handoff_rx.recv_timeout(self.poll_interval) {
                Ok(Handoff::Request(handles)) => return Some(handles),
                // Only the producer sends `Done`; a zero-capacity channel
                // never hands a thread its own message.
                Ok(Handoff::Done(_)) => continue,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn answer(&self, has_batch: bool, cancel: &AtomicBool) -> bool {
        let mut msg = Handoff::Done(has_batch);
        loop {
            match self.handoff_tx.send_timeout(msg, self.poll_interval) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.stopped(cancel) {
                        return false;
                    }
                    msg = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

/// How a serving loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeOutcome {
    Finished { delivered: u64 },
    Failed { delivered: u64, message: String },
    Abandoned { delivered: u64 },
}
