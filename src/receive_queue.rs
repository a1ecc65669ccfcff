use crate::config::ReceiveQueueConfig;
use crate::fragment::Fragment;
use crate::ids::{FragmentNumber, SerialNumber};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Result of admitting one fragment. Everything except `Accepted` leaves the queue unchanged.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[must_use]
pub enum AdmitOutcome {
    Accepted {
        /// true iff this admission signalled a blocked consumer (wake-threshold crossing or
        ///  completion of the call body)
        woke_consumer: bool,
    },
    /// the same fragment is already buffered - admitting it again is idempotent
    Duplicate,
    /// a stale or malformed fragment that is silently dropped per protocol rules
    Stale,
    /// admitting would exceed the configured queue bound; the call layer decides between
    ///  backpressure and aborting the call
    QueueFull,
}

/// Result of waiting for deliverable data, with cancellation and deadline expiry as
///  first-class outcomes distinct from a normal wake.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitOutcome {
    /// the wake threshold is reached - there is enough in-order data to be worth consuming
    Ready,
    /// all fragments of the call body have been received
    Complete,
    TimedOut,
    Cancelled,
}

struct ReceiveQueueInner {
    config: Arc<ReceiveQueueConfig>,

    /// All buffered fragments that are not yet consumed.
    ///
    /// NB: There is an invariant that the keys in `[delivery_head, next_fragnum)` are all
    ///      present (the gap-free in-order run), while keys above `next_fragnum` may have gaps.
    fragments: BTreeMap<FragmentNumber, Fragment>,

    /// the next fragment number to be handed to the consumer
    delivery_head: FragmentNumber,

    /// the next fragment number *not* part of the contiguous in-order run
    next_fragnum: FragmentNumber,

    /// the highest fragment number seen so far, `None` initially so the first fragment of a
    ///  call is always accepted
    high_fragnum: Option<FragmentNumber>,
    high_serial: Option<SerialNumber>,

    /// the number of the final fragment, once a fragment with the 'last' flag was seen
    last_fragnum: Option<FragmentNumber>,
    all_received: bool,
    reassembly_in_progress: bool,

    queued_bytes: usize,
    /// bytes in the in-order run, i.e. what a consumer could take right now
    deliverable_bytes: usize,

    cancelled: bool,
}

impl ReceiveQueueInner {
    fn new(config: Arc<ReceiveQueueConfig>) -> ReceiveQueueInner {
        ReceiveQueueInner {
            config,
            fragments: Default::default(),
            delivery_head: FragmentNumber::ZERO,
            next_fragnum: FragmentNumber::ZERO,
            high_fragnum: None,
            high_serial: None,
            last_fragnum: None,
            all_received: false,
            reassembly_in_progress: false,
            queued_bytes: 0,
            deliverable_bytes: 0,
            cancelled: false,
        }
    }

    fn admit(&mut self, fragment: Fragment) -> AdmitOutcome {
        if self.cancelled {
            trace!("fragment #{} arrived after queue cancellation - dropping", fragment.number);
            return AdmitOutcome::Stale;
        }

        if fragment.number < self.delivery_head {
            trace!("fragment #{} is below the delivery head #{} - dropping stale duplicate", fragment.number, self.delivery_head);
            return AdmitOutcome::Stale;
        }

        if let Some(last) = self.last_fragnum {
            if fragment.number > last {
                debug!("fragment #{} is beyond the final fragment #{} - dropping", fragment.number, last);
                return AdmitOutcome::Stale;
            }
            if fragment.last_frag && fragment.number != last {
                debug!("fragment #{} claims to be final but #{} already is - dropping", fragment.number, last);
                return AdmitOutcome::Stale;
            }
        }

        if let Some(buffered) = self.fragments.get(&fragment.number) {
            trace!("fragment #{} (serial {}) is already buffered with serial {} - ignoring", fragment.number, fragment.serial, buffered.serial);
            // a retransmission still moves the serial high-water mark
            if Some(fragment.serial) > self.high_serial {
                self.high_serial = Some(fragment.serial);
            }
            return AdmitOutcome::Duplicate;
        }

        if self.fragments.len() >= self.config.max_queued_fragments {
            debug!("fragment #{} would exceed the queue bound of {} fragments", fragment.number, self.config.max_queued_fragments);
            return AdmitOutcome::QueueFull;
        }

        let number = fragment.number;
        let payload_len = fragment.len();

        if Some(fragment.number) > self.high_fragnum {
            self.high_fragnum = Some(fragment.number);
        }
        if Some(fragment.serial) > self.high_serial {
            self.high_serial = Some(fragment.serial);
        }

        if fragment.last_frag {
            self.last_fragnum = Some(number);

            // fragments buffered beyond the now-known final fragment are sender-side garbage
            let beyond = self.fragments.split_off(&number.next());
            for (dropped_number, dropped) in beyond {
                debug!("discarding buffered fragment #{} beyond the final fragment #{}", dropped_number, number);
                self.queued_bytes -= dropped.len();
            }
        }

        self.fragments.insert(number, fragment);
        self.reassembly_in_progress = true;
        self.queued_bytes += payload_len;

        let old_deliverable_bytes = self.deliverable_bytes;

        // advance the in-order run through any immediately following buffered fragments
        if number == self.next_fragnum {
            while let Some(run_fragment) = self.fragments.get(&self.next_fragnum) {
                self.deliverable_bytes += run_fragment.len();
                self.next_fragnum = self.next_fragnum.next();
            }
        }

        let mut became_all_received = false;
        if let Some(last) = self.last_fragnum {
            if !self.all_received && self.next_fragnum > last {
                self.all_received = true;
                became_all_received = true;
            }
        }

        let threshold = self.config.wake_threshold_bytes;
        let crossed_threshold =
            old_deliverable_bytes < threshold && self.deliverable_bytes >= threshold;

        AdmitOutcome::Accepted {
            woke_consumer: crossed_threshold || became_all_received,
        }
    }

    /// Remove the in-order run from the queue and hand it to the consumer as one contiguous
    ///  byte sequence, in fragment-number order.
    fn take_deliverable(&mut self) -> Option<Bytes> {
        if self.delivery_head == self.next_fragnum {
            return None;
        }

        let mut assembled = BytesMut::with_capacity(self.deliverable_bytes);
        while self.delivery_head < self.next_fragnum {
            let fragment = self.fragments.remove(&self.delivery_head)
                .expect("in-order run fragments must be buffered");
            self.queued_bytes -= fragment.len();
            assembled.put_slice(&fragment.payload);
            self.delivery_head = self.delivery_head.next();
        }
        self.deliverable_bytes = 0;

        if self.all_received && self.fragments.is_empty() {
            self.reassembly_in_progress = false;
        }

        trace!("consuming {} in-order bytes up to fragment #{}", assembled.len(), self.delivery_head);
        Some(assembled.freeze())
    }

    fn drain(&mut self) {
        if !self.fragments.is_empty() {
            debug!("draining {} residual fragments", self.fragments.len());
        }
        self.fragments.clear();
        self.queued_bytes = 0;
        self.deliverable_bytes = 0;
        self.reassembly_in_progress = false;
    }
}

/// Per-call reassembly queue: accepts the call's body fragments in arbitrary network arrival
///  order and exposes the contiguous in-order prefix to the consumer, bounding memory use.
///
/// A queue has (at most) one producer - the packet-arrival path - and one consumer - the
///  call's execution - which may run on different tasks; all further synchronisation is
///  internal.
pub struct ReceiveQueue {
    inner: RwLock<ReceiveQueueInner>,
    data_ready: Notify,
}

impl ReceiveQueue {
    pub fn new(config: Arc<ReceiveQueueConfig>) -> ReceiveQueue {
        ReceiveQueue {
            inner: RwLock::new(ReceiveQueueInner::new(config)),
            data_ready: Notify::new(),
        }
    }

    pub async fn admit(&self, fragment: Fragment) -> AdmitOutcome {
        let outcome = self.inner.write().await.admit(fragment);
        if let AdmitOutcome::Accepted { woke_consumer: true } = outcome {
            self.data_ready.notify_waiters();
        }
        outcome
    }

    pub async fn take_deliverable(&self) -> Option<Bytes> {
        self.inner.write().await.take_deliverable()
    }

    /// Block until there is enough in-order data (the wake threshold), the call body is
    ///  complete, the deadline expires, or the queue is cancelled - whichever happens first.
    pub async fn wait_deliverable(&self, deadline: Option<Instant>) -> WaitOutcome {
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            // register interest *before* checking state, so a wake between the check and the
            //  await below is not lost
            notified.as_mut().enable();

            {
                let inner = self.inner.read().await;
                if inner.cancelled {
                    return WaitOutcome::Cancelled;
                }
                if inner.all_received {
                    return WaitOutcome::Complete;
                }
                if inner.deliverable_bytes >= inner.config.wake_threshold_bytes {
                    return WaitOutcome::Ready;
                }
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    select! {
                        _ = &mut notified => {}
                        _ = sleep_until(deadline) => {
                            return WaitOutcome::TimedOut;
                        }
                    }
                }
            }
        }
    }

    /// Cancel the queue: every current and future [Self::wait_deliverable] call observes
    ///  [WaitOutcome::Cancelled], and late fragments are dropped. This must happen before
    ///  [Self::drain] on teardown so no consumer can be left blocked.
    pub async fn cancel(&self) {
        self.inner.write().await.cancelled = true;
        self.data_ready.notify_waiters();
    }

    /// Release all buffered fragments regardless of position; used on call teardown. The
    ///  caller must guarantee that no consumer is still blocked on this queue (by calling
    ///  [Self::cancel] first).
    pub async fn drain(&self) {
        self.inner.write().await.drain();
    }

    pub async fn is_all_received(&self) -> bool {
        self.inner.read().await.all_received
    }

    pub async fn is_reassembly_in_progress(&self) -> bool {
        self.inner.read().await.reassembly_in_progress
    }

    pub async fn queued_fragments(&self) -> usize {
        self.inner.read().await.fragments.len()
    }

    pub async fn queued_bytes(&self) -> usize {
        self.inner.read().await.queued_bytes
    }

    pub async fn next_expected(&self) -> FragmentNumber {
        self.inner.read().await.next_fragnum
    }

    pub async fn highest_fragment_seen(&self) -> Option<FragmentNumber> {
        self.inner.read().await.high_fragnum
    }

    pub async fn highest_serial_seen(&self) -> Option<SerialNumber> {
        self.inner.read().await.high_serial
    }
}
