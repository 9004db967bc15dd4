// Request/reply correlation over one shared wildcard inbox.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::message::Message;

pub(crate) struct RequestMux {
    // `<inbox_prefix>.<nuid>` once the wildcard subscription exists.
    inbox: Mutex<Option<String>>,
    next_token: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl RequestMux {
    pub(crate) fn new() -> Self {
        Self {
            inbox: Mutex::new(None),
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared inbox, creating it with `subscribe` on first use.
    /// `subscribe` receives the inbox and must register `<inbox>.*`.
    pub(crate) fn ensure_inbox(
        &self,
        fresh_inbox: impl FnOnce() -> String,
        subscribe: impl FnOnce(&str) -> Result<()>,
    ) -> Result<String> {
        let mut inbox = self.inbox.lock();
        if let Some(existing) = inbox.as_ref() {
            return Ok(existing.clone());
        }
        let created = fresh_inbox();
        subscribe(&created)?;
        *inbox = Some(created.clone());
        Ok(created)
    }

    pub(crate) fn register(self: &Arc<Self>, inbox: &str) -> PendingReply {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token.clone(), tx);
        PendingReply {
            subject: format!("{inbox}.{token}"),
            token,
            rx,
            mux: self.clone(),
        }
    }

    /// Completes the request whose token ends `msg.subject`. Late or unknown
    /// replies are dropped.
    pub(crate) fn resolve(&self, msg: Message) -> bool {
        let Some((_, token)) = msg.subject.rsplit_once('.') else {
            return false;
        };
        let Some(tx) = self.pending.lock().remove(token) else {
            tracing::debug!(subject = %msg.subject, "reply for unknown request");
            return false;
        };
        tx.send(msg).is_ok()
    }

    /// Dropping the senders wakes every waiter with `ConnectionClosed`.
    pub(crate) fn fail_all(&self) {
        let failed = std::mem::take(&mut *self.pending.lock());
        if !failed.is_empty() {
            tracing::debug!(requests = failed.len(), "failing in-flight requests");
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A registered request. Dropping it removes the correlator entry.
pub(crate) struct PendingReply {
    subject: String,
    token: String,
    rx: oneshot::Receiver<Message>,
    mux: Arc<RequestMux>,
}

impl PendingReply {
    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }

    pub(crate) async fn wait(&mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Ok(Ok(msg)) if msg.is_no_responders() => Err(Error::NoResponders),
            Ok(Ok(msg)) => Ok(msg),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.mux.pending.lock().remove(&self.token);
    }
}
