// Subscription registry and the handles applications hold.
//
// The read loop dispatches by sid and never blocks: every subscription has an
// unbounded channel whose depth is policed by its own pending limits, so an
// over-limit subscription drops messages instead of stalling the connection.
use bytes::BytesMut;
use courier_wire::ops::{encode_subscribe, encode_unsubscribe};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::client::ClientInner;
use crate::error::{Error, Result};
use crate::message::Message;

pub(crate) struct SubEntry {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue: Option<String>,
    // The shared request inbox is answered inline by the read loop.
    requests: bool,
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    max_msgs: AtomicUsize,
    max_bytes: AtomicUsize,
    pending_msgs: AtomicUsize,
    pending_bytes: AtomicUsize,
    received: AtomicU64,
    dropped: AtomicU64,
    auto_max: AtomicU64,
    slow: AtomicBool,
    pub(crate) closed: AtomicBool,
}

impl SubEntry {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue: Option<String>,
        tx: mpsc::UnboundedSender<Message>,
        limits: (usize, usize),
    ) -> Self {
        Self::build(sid, subject, queue, false, Some(tx), limits)
    }

    pub(crate) fn requests(sid: u64, subject: String) -> Self {
        Self::build(sid, subject, None, true, None, (0, 0))
    }

    fn build(
        sid: u64,
        subject: String,
        queue: Option<String>,
        requests: bool,
        tx: Option<mpsc::UnboundedSender<Message>>,
        (max_msgs, max_bytes): (usize, usize),
    ) -> Self {
        Self {
            sid,
            subject,
            queue,
            requests,
            tx: Mutex::new(tx),
            max_msgs: AtomicUsize::new(max_msgs),
            max_bytes: AtomicUsize::new(max_bytes),
            pending_msgs: AtomicUsize::new(0),
            pending_bytes: AtomicUsize::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            auto_max: AtomicU64::new(0),
            slow: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub(crate) fn set_auto_max(&self, max: u64) {
        self.auto_max.store(max, Ordering::Release);
    }

    fn offer(&self, msg: Message) -> Dispatched {
        let size = msg.pending_size();
        let max_msgs = self.max_msgs.load(Ordering::Relaxed);
        let max_bytes = self.max_bytes.load(Ordering::Relaxed);
        let msgs = self.pending_msgs.load(Ordering::Acquire) + 1;
        let bytes = self.pending_bytes.load(Ordering::Acquire) + size;
        if (max_msgs > 0 && msgs > max_msgs) || (max_bytes > 0 && bytes > max_bytes) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let first = !self.slow.swap(true, Ordering::AcqRel);
            return Dispatched::SlowConsumer { first };
        }

        self.pending_msgs.fetch_add(1, Ordering::AcqRel);
        self.pending_bytes.fetch_add(size, Ordering::AcqRel);
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        };
        if sent {
            Dispatched::Delivered
        } else {
            self.pending_msgs.fetch_sub(1, Ordering::AcqRel);
            self.pending_bytes.fetch_sub(size, Ordering::AcqRel);
            Dispatched::Unknown
        }
    }

    // A message left the queue; the slow episode ends once the backlog is empty.
    fn consumed(&self, msg: &Message) {
        self.pending_bytes
            .fetch_sub(msg.pending_size(), Ordering::AcqRel);
        if self.pending_msgs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slow.store(false, Ordering::Release);
        }
    }

    fn close_delivery(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().take();
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatched {
    Delivered,
    /// Addressed to the shared request inbox.
    Request(Message),
    SlowConsumer {
        first: bool,
    },
    /// No such sid, or the subscription already went away.
    Unknown,
}

pub(crate) struct Registry {
    next_sid: AtomicU64,
    subs: Mutex<HashMap<u64, Arc<SubEntry>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_sid: AtomicU64::new(1),
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Sids are never reused for the life of the connection.
    pub(crate) fn next_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, entry: Arc<SubEntry>) {
        self.subs.lock().insert(entry.sid, entry);
    }

    pub(crate) fn remove(&self, sid: u64) -> Option<Arc<SubEntry>> {
        let entry = self.subs.lock().remove(&sid);
        if let Some(entry) = &entry {
            entry.close_delivery();
        }
        entry
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub(crate) fn dispatch(&self, sid: u64, msg: Message) -> (Dispatched, Option<Arc<SubEntry>>) {
        let Some(entry) = self.subs.lock().get(&sid).cloned() else {
            return (Dispatched::Unknown, None);
        };
        let received = entry.received.fetch_add(1, Ordering::AcqRel) + 1;
        let max = entry.auto_max.load(Ordering::Acquire);
        if max > 0 && received > max {
            return (Dispatched::Unknown, Some(entry));
        }
        let outcome = if entry.requests {
            Dispatched::Request(msg)
        } else {
            entry.offer(msg)
        };
        if max > 0 && received == max {
            self.remove(sid);
        }
        (outcome, Some(entry))
    }

    /// SUB (and any remaining auto-unsubscribe count) for every live
    /// subscription, oldest first.
    pub(crate) fn replay(&self, dst: &mut BytesMut) -> usize {
        let mut entries: Vec<Arc<SubEntry>> = self.subs.lock().values().cloned().collect();
        entries.sort_by_key(|entry| entry.sid);
        for entry in &entries {
            encode_subscribe(dst, &entry.subject, entry.queue.as_deref(), entry.sid);
            let max = entry.auto_max.load(Ordering::Acquire);
            if max > 0 {
                let remaining = max.saturating_sub(entry.received());
                encode_unsubscribe(dst, entry.sid, Some(remaining));
            }
        }
        entries.len()
    }

    pub(crate) fn close_all(&self) {
        let drained: Vec<Arc<SubEntry>> = self.subs.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.close_delivery();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Pulled with [`Subscription::next_message`].
    Sync,
    /// Pushed to a handler running on its own task.
    Async,
}

enum Delivery {
    Sync(mpsc::UnboundedReceiver<Message>),
    Async(JoinHandle<()>),
}

/// A live interest in a subject. Dropping the handle unsubscribes.
pub struct Subscription {
    entry: Arc<SubEntry>,
    inner: Arc<ClientInner>,
    delivery: Delivery,
}

impl Subscription {
    pub(crate) fn sync(
        entry: Arc<SubEntry>,
        inner: Arc<ClientInner>,
        rx: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            entry,
            inner,
            delivery: Delivery::Sync(rx),
        }
    }

    pub(crate) fn with_handler<F, Fut>(
        entry: Arc<SubEntry>,
        inner: Arc<ClientInner>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        mut handler: F,
    ) -> Self
    where
        F: FnMut(Message) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_entry = entry.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                task_entry.consumed(&msg);
                handler(msg).await;
            }
            tracing::debug!(sid = task_entry.sid, "subscription handler finished");
        });
        Self {
            entry,
            inner,
            delivery: Delivery::Async(task),
        }
    }

    pub fn sid(&self) -> u64 {
        self.entry.sid
    }

    pub fn subject(&self) -> &str {
        &self.entry.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.entry.queue.as_deref()
    }

    pub fn mode(&self) -> SubscriptionMode {
        match self.delivery {
            Delivery::Sync(_) => SubscriptionMode::Sync,
            Delivery::Async(_) => SubscriptionMode::Async,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.entry.closed.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for the next message.
    ///
    /// Queued messages are still handed out after the subscription closes;
    /// `SubscriptionClosed` follows once the queue is empty.
    pub async fn next_message(&mut self, timeout: Duration) -> Result<Message> {
        let Delivery::Sync(rx) = &mut self.delivery else {
            return Err(Error::InvalidOperation(
                "next_message on a handler subscription",
            ));
        };
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(None) => Err(Error::SubscriptionClosed),
            Ok(Some(msg)) => {
                self.entry.consumed(&msg);
                Ok(msg)
            }
        }
    }

    /// Safe to call repeatedly; later calls do nothing.
    pub fn unsubscribe(&self) -> Result<()> {
        self.inner.unsubscribe_entry(&self.entry)
    }

    /// Lets the server end the subscription after `max` messages in total.
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        self.inner.auto_unsubscribe_entry(&self.entry, max)
    }

    /// Zero disables the corresponding limit.
    pub fn set_pending_limits(&self, msgs: usize, bytes: usize) {
        self.entry.max_msgs.store(msgs, Ordering::Relaxed);
        self.entry.max_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn pending_limits(&self) -> (usize, usize) {
        (
            self.entry.max_msgs.load(Ordering::Relaxed),
            self.entry.max_bytes.load(Ordering::Relaxed),
        )
    }

    /// Queued messages and bytes not yet handed to the application.
    pub fn pending(&self) -> (usize, usize) {
        (
            self.entry.pending_msgs.load(Ordering::Acquire),
            self.entry.pending_bytes.load(Ordering::Acquire),
        )
    }

    /// Messages that arrived for this subscription, including dropped ones.
    pub fn delivered(&self) -> u64 {
        self.entry.received()
    }

    /// Messages discarded because the subscription was over its limits.
    pub fn dropped(&self) -> u64 {
        self.entry.dropped.load(Ordering::Relaxed)
    }

    pub fn is_slow(&self) -> bool {
        self.entry.slow.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.inner.unsubscribe_entry(&self.entry);
        if let Delivery::Async(task) = &self.delivery {
            // The handler drains what was queued, then exits on its own.
            tracing::trace!(sid = self.entry.sid, finished = task.is_finished(), "subscription dropped");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.entry.sid)
            .field("subject", &self.entry.subject)
            .field("queue", &self.entry.queue)
            .field("mode", &self.mode())
            .finish()
    }
}
