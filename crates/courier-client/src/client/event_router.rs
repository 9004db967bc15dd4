// Lifecycle and async-error events, delivered in order by one dispatcher task.
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Reconnected,
    Closed,
    SlowConsumer { sid: u64, subject: String },
    /// A non-fatal `-ERR`, e.g. a permissions violation.
    ServerError(String),
    /// The server announced it is shutting down soon.
    LameDuckMode,
    ServersDiscovered(Vec<String>),
}

pub(crate) type EventListener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;
pub(crate) type LifecycleListener = Arc<dyn Fn() + Send + Sync>;
pub(crate) type ErrorListener = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Listeners {
    pub(crate) on_event: Vec<EventListener>,
    pub(crate) on_disconnected: Option<LifecycleListener>,
    pub(crate) on_reconnected: Option<LifecycleListener>,
    pub(crate) on_closed: Option<LifecycleListener>,
    pub(crate) on_async_error: Option<ErrorListener>,
}

impl Listeners {
    fn deliver(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Disconnected => call(&self.on_disconnected),
            ClientEvent::Reconnected => call(&self.on_reconnected),
            ClientEvent::Closed => call(&self.on_closed),
            ClientEvent::SlowConsumer { sid, subject } => {
                if let Some(listener) = &self.on_async_error {
                    listener(&Error::SlowConsumer {
                        sid: *sid,
                        subject: subject.clone(),
                    });
                }
            }
            ClientEvent::ServerError(message) => {
                if let Some(listener) = &self.on_async_error {
                    listener(&Error::Server(message.clone()));
                }
            }
            ClientEvent::Connected
            | ClientEvent::LameDuckMode
            | ClientEvent::ServersDiscovered(_) => {}
        }
        for listener in &self.on_event {
            listener(event);
        }
    }
}

fn call(listener: &Option<LifecycleListener>) {
    if let Some(listener) = listener {
        listener();
    }
}

/// Emitters never block; the dispatcher runs listeners one event at a time.
pub(crate) struct EventRouter {
    tx: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
}

impl EventRouter {
    pub(crate) fn spawn(listeners: Listeners) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::debug!(?event, "dispatching client event");
                listeners.deliver(&event);
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Emits a final event; the dispatcher exits once it has been delivered.
    pub(crate) fn finish(&self, last: ClientEvent) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(last);
        }
    }
}
