//! Client handle and the connection state it shares with background tasks.
//!
//! # Purpose
//! `Client` is the application-facing API: publish, subscribe, request, flush
//! and close. Every clone shares one `ClientInner`, which owns the outbound
//! buffer, the subscription registry, the request correlator and the server
//! pool.
//!
//! # Design notes
//! The supervisor task owns every state transition after the first connect.
//! Application calls only touch locked buffers and never wait on the socket,
//! so publishing keeps working (into the reconnect buffer) while a reconnect
//! is in progress.
use bytes::BytesMut;
use courier_wire::ops::{encode_publish, encode_subscribe, encode_unsubscribe, publish_size};
use courier_wire::{HeaderMap, ServerInfo, validate_queue, validate_subject};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::connection::{Established, establish};
use crate::client::event_router::{ClientEvent, EventRouter};
use crate::client::outbound::{FrameKind, Outbound};
use crate::client::reconnect::supervise;
use crate::client::request::RequestMux;
use crate::client::subscription::{Registry, SubEntry, Subscription};
use crate::config::Options;
use crate::counters::{Statistics, StatisticsSnapshot};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::server_pool::ServerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

pub(crate) struct ClientInner {
    pub(crate) options: Options,
    pub(crate) outbound: Outbound,
    pub(crate) registry: Registry,
    pub(crate) requests: Arc<RequestMux>,
    pub(crate) events: EventRouter,
    pub(crate) stats: Statistics,
    pub(crate) pool: Mutex<ServerPool>,
    pub(crate) shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
    server_info: Mutex<Option<ServerInfo>>,
    connected_url: Mutex<Option<String>>,
    last_error: Mutex<Option<Error>>,
    max_payload: AtomicUsize,
    closed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn new(options: Options, pool: ServerPool) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            outbound: Outbound::new(options.reconnect_buffer_size, options.flush_threshold),
            registry: Registry::new(),
            requests: Arc::new(RequestMux::new()),
            events: EventRouter::spawn(options.listeners.clone()),
            stats: Statistics::default(),
            pool: Mutex::new(pool),
            shutdown: CancellationToken::new(),
            state,
            server_info: Mutex::new(None),
            connected_url: Mutex::new(None),
            last_error: Mutex::new(None),
            max_payload: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            options,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn record_error(&self, err: &Error) {
        *self.last_error.lock() = Some(err.clone());
    }

    /// Records what the server announced. `announce` raises events for
    /// discovered servers and lame duck mode.
    pub(crate) fn apply_info(&self, info: ServerInfo, announce: bool) {
        if info.max_payload > 0 {
            self.max_payload.store(info.max_payload, Ordering::Release);
        }
        if !info.connect_urls.is_empty() {
            let added = self.pool.lock().merge_discovered(&info.connect_urls);
            if !added.is_empty() {
                debug!(servers = ?added, "discovered servers");
                if announce {
                    self.events.emit(ClientEvent::ServersDiscovered(added));
                }
            }
        }
        if announce && info.lame_duck_mode {
            warn!(server = %info.server_name, "server entered lame duck mode");
            self.events.emit(ClientEvent::LameDuckMode);
        }
        *self.server_info.lock() = Some(info);
    }

    /// Makes `session` the live transport: replays subscriptions and the
    /// reconnect buffer, then reports the transition.
    pub(crate) fn activate(&self, session: &Established, reconnected: bool) {
        self.apply_info(session.info.clone(), false);
        *self.connected_url.lock() = Some(session.addr.to_string());
        let replayed = self.outbound.resume(|buf| {
            self.registry.replay(buf);
        });
        self.set_state(ConnectionState::Connected);
        if reconnected {
            self.stats.record_reconnect();
            self.events.emit(ClientEvent::Reconnected);
        } else {
            self.events.emit(ClientEvent::Connected);
        }
        info!(
            server = %session.addr,
            subscriptions = self.registry.len(),
            replayed,
            reconnected,
            "connected"
        );
    }

    /// The transport went away. Publishes are buffered from here on.
    pub(crate) fn disconnected(&self) {
        let lost = self.outbound.begin_reconnect();
        *self.connected_url.lock() = None;
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(ClientEvent::Disconnected);
        debug!(unwritten_bytes = lost, "transport lost");
    }

    /// Terminal transition. Safe to call more than once.
    pub(crate) fn finish_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.outbound.close();
        self.requests.fail_all();
        self.registry.close_all();
        *self.connected_url.lock() = None;
        self.set_state(ConnectionState::Closed);
        self.events.finish(ClientEvent::Closed);
        info!("connection closed");
    }

    pub(crate) fn new_inbox(&self) -> String {
        format!(
            "{}.{}",
            self.options.inbox_prefix,
            self.options.id_generator.next_id()
        )
    }

    pub(crate) fn publish_raw(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: &[u8],
    ) -> Result<()> {
        validate_subject(subject)?;
        if let Some(reply) = reply {
            validate_subject(reply)?;
        }
        let size = publish_size(headers, payload);
        let max = self.max_payload.load(Ordering::Acquire);
        if max > 0 && size > max {
            return Err(Error::MaxPayloadExceeded { size, max });
        }
        let mut frame = BytesMut::with_capacity(subject.len() + size + 48);
        encode_publish(&mut frame, subject, reply, headers, payload)?;
        self.outbound.enqueue(FrameKind::Publish, &frame)?;
        self.stats.record_out(size);
        Ok(())
    }

    fn subscribe_entry(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<(Arc<SubEntry>, mpsc::UnboundedReceiver<Message>)> {
        validate_subject(subject)?;
        if let Some(queue) = queue {
            validate_queue(queue)?;
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = Arc::new(SubEntry::new(
            self.registry.next_sid(),
            subject.to_string(),
            queue.map(str::to_string),
            tx,
            (self.options.pending_msgs_limit, self.options.pending_bytes_limit),
        ));
        // Registered before the SUB is queued so a concurrent replay covers it.
        self.registry.insert(entry.clone());
        let mut frame = BytesMut::new();
        encode_subscribe(&mut frame, subject, queue, entry.sid);
        if let Err(err) = self.outbound.enqueue(FrameKind::Control, &frame) {
            self.registry.remove(entry.sid);
            return Err(err);
        }
        debug!(sid = entry.sid, subject, queue, "subscribed");
        Ok((entry, rx))
    }

    pub(crate) fn unsubscribe_entry(&self, entry: &SubEntry) -> Result<()> {
        if entry.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.registry.remove(entry.sid);
        let mut frame = BytesMut::new();
        encode_unsubscribe(&mut frame, entry.sid, None);
        match self.outbound.enqueue(FrameKind::Control, &frame) {
            Err(Error::ConnectionClosed) | Ok(()) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn auto_unsubscribe_entry(&self, entry: &SubEntry, max: u64) -> Result<()> {
        if entry.closed.load(Ordering::Acquire) {
            return Err(Error::SubscriptionClosed);
        }
        if max == 0 || max <= entry.received() {
            return self.unsubscribe_entry(entry);
        }
        entry.set_auto_max(max);
        let mut frame = BytesMut::new();
        encode_unsubscribe(&mut frame, entry.sid, Some(max));
        self.outbound.enqueue(FrameKind::Control, &frame)
    }

    fn request_inbox(&self) -> Result<String> {
        self.requests.ensure_inbox(
            || self.new_inbox(),
            |inbox| {
                let sid = self.registry.next_sid();
                let subject = format!("{inbox}.*");
                self.registry
                    .insert(Arc::new(SubEntry::requests(sid, subject.clone())));
                let mut frame = BytesMut::new();
                encode_subscribe(&mut frame, &subject, None, sid);
                if let Err(err) = self.outbound.enqueue(FrameKind::Control, &frame) {
                    self.registry.remove(sid);
                    return Err(err);
                }
                Ok(())
            },
        )
    }
}

// Cancels the supervisor once the last `Client` clone is gone.
struct CloseGuard(CancellationToken);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// A connection to a courier server cluster.
///
/// Cheap to clone. The connection closes when [`Client::close`] is called or
/// the last clone is dropped; subscriptions outliving it report
/// `SubscriptionClosed`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    _guard: Arc<CloseGuard>,
}

impl Client {
    /// Connects to the first reachable server in `options.servers`.
    ///
    /// With `retry_on_failed_connect` set, an unreachable cluster does not
    /// fail the call: the client starts in `Reconnecting` and keeps trying in
    /// the background.
    pub async fn connect(options: Options) -> Result<Self> {
        let pool = ServerPool::new(&options.servers, !options.no_randomize)?;
        let inner = Arc::new(ClientInner::new(options, pool));

        let mut last_err = Error::NoServers;
        let mut established = None;
        let attempts = inner.pool.lock().len();
        for _ in 0..attempts {
            let Some(candidate) = inner.pool.lock().next_candidate() else {
                break;
            };
            inner.pool.lock().report_attempt(&candidate.addr);
            match establish(&inner.options, &candidate.addr).await {
                Ok(session) => {
                    inner.pool.lock().report_success(&candidate.addr);
                    established = Some(session);
                    break;
                }
                Err(err) if err.is_fatal() => {
                    warn!(server = %candidate.addr, error = %err, "connect rejected");
                    inner.finish_close();
                    return Err(err);
                }
                Err(err) => {
                    debug!(server = %candidate.addr, error = %err, "connect attempt failed");
                    inner.pool.lock().report_failure(&candidate.addr);
                    last_err = err;
                }
            }
        }

        match &established {
            Some(session) => inner.activate(session, false),
            None if inner.options.retry_on_failed_connect => {
                warn!(error = %last_err, "initial connect failed, retrying in background");
                inner.record_error(&last_err);
                inner.set_state(ConnectionState::Reconnecting);
            }
            None => {
                inner.finish_close();
                return Err(last_err);
            }
        }

        tokio::spawn(supervise(inner.clone(), established));
        let guard = Arc::new(CloseGuard(inner.shutdown.clone()));
        Ok(Self {
            inner,
            _guard: guard,
        })
    }

    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<()> {
        self.inner
            .publish_raw(subject, None, None, payload.as_ref())
    }

    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.inner
            .publish_raw(subject, None, Some(headers), payload.as_ref())
    }

    /// Publishes with a reply subject for responders to answer on.
    pub fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.inner
            .publish_raw(subject, Some(reply), None, payload.as_ref())
    }

    pub fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let (entry, rx) = self.inner.subscribe_entry(subject, None)?;
        Ok(Subscription::sync(entry, self.inner.clone(), rx))
    }

    /// Each message on `subject` goes to one member of `queue`.
    pub fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<Subscription> {
        let (entry, rx) = self.inner.subscribe_entry(subject, Some(queue))?;
        Ok(Subscription::sync(entry, self.inner.clone(), rx))
    }

    /// Runs `handler` for each message, one at a time and in arrival order.
    pub fn subscribe_with_handler<F, Fut>(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: F,
    ) -> Result<Subscription>
    where
        F: FnMut(Message) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (entry, rx) = self.inner.subscribe_entry(subject, queue)?;
        Ok(Subscription::with_handler(
            entry,
            self.inner.clone(),
            rx,
            handler,
        ))
    }

    pub async fn request(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_inner(subject, None, payload.as_ref(), timeout)
            .await
    }

    pub async fn request_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_inner(subject, Some(headers), payload.as_ref(), timeout)
            .await
    }

    async fn request_inner(
        &self,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        if self.inner.options.old_request_style {
            return self.request_with_inbox(subject, headers, payload, timeout).await;
        }
        let inbox = self.inner.request_inbox()?;
        let mut pending = self.inner.requests.register(&inbox);
        self.inner
            .publish_raw(subject, Some(pending.subject()), headers, payload)?;
        pending.wait(timeout).await
    }

    // One throwaway inbox subscription per request.
    async fn request_with_inbox(
        &self,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = self.inner.new_inbox();
        let mut sub = self.subscribe(&inbox)?;
        sub.auto_unsubscribe(1)?;
        self.inner
            .publish_raw(subject, Some(&inbox), headers, payload)?;
        match sub.next_message(timeout).await {
            Ok(msg) if msg.is_no_responders() => Err(Error::NoResponders),
            Ok(msg) => Ok(msg),
            Err(Error::SubscriptionClosed) => Err(Error::ConnectionClosed),
            Err(err) => Err(err),
        }
    }

    /// A unique subject under the configured inbox prefix.
    pub fn new_inbox(&self) -> String {
        self.inner.new_inbox()
    }

    /// Waits until the server has confirmed everything published so far.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let Some(rx) = self.inner.outbound.begin_flush()? else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Shuts the connection down and waits for the supervisor to finish.
    /// Queued bytes get one last write attempt.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watches state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The most recent INFO from the connected server.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.lock().clone()
    }

    pub fn connected_url(&self) -> Option<String> {
        self.inner.connected_url.lock().clone()
    }

    /// Seed and discovered servers, credentials redacted.
    pub fn servers(&self) -> Vec<String> {
        self.inner.pool.lock().servers()
    }

    /// Largest payload the server accepts, or zero before the first INFO.
    pub fn max_payload(&self) -> usize {
        self.inner.max_payload.load(Ordering::Acquire)
    }

    /// The error that last ended a connection attempt or session.
    pub fn last_error(&self) -> Option<Error> {
        self.inner.last_error.lock().clone()
    }

    /// Publishes currently held in the reconnect buffer, in bytes.
    pub fn buffered(&self) -> usize {
        self.inner.outbound.reconnect_buffered()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("connected_url", &self.connected_url())
            .finish_non_exhaustive()
    }
}
