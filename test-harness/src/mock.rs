// In-process mock broker speaking the text protocol.
//
// Enough of a real server to drive the client end to end: subject wildcards,
// queue groups, echo suppression, auto-unsubscribe, no-responders replies and
// simple CONNECT authentication. Tests reach in to kill sockets, stop and
// restart the listener, silence PONGs or push raw protocol lines.
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use courier_wire::{
    ClientOp, ConnectInfo, HeaderMap, ServerCodec, ServerInfo, ServerOp, StatusCode,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

/// How the mock decides whether to accept a CONNECT.
#[derive(Clone)]
pub enum MockAuth {
    UserPass { user: String, pass: String },
    Token(String),
    Custom(Arc<dyn Fn(&ConnectInfo) -> bool + Send + Sync>),
}

impl MockAuth {
    fn accepts(&self, connect: &ConnectInfo) -> bool {
        match self {
            MockAuth::UserPass { user, pass } => {
                connect.user.as_deref() == Some(user) && connect.pass.as_deref() == Some(pass)
            }
            MockAuth::Token(token) => connect.auth_token.as_deref() == Some(token),
            MockAuth::Custom(check) => check(connect),
        }
    }
}

#[derive(Clone)]
pub struct MockServerConfig {
    pub server_name: String,
    pub max_payload: usize,
    pub nonce: Option<String>,
    pub auth: Option<MockAuth>,
    pub connect_urls: Vec<String>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            server_name: "mock".to_string(),
            max_payload: 1024 * 1024,
            nonce: None,
            auth: None,
            connect_urls: Vec::new(),
            tls: None,
        }
    }
}

/// A message the mock accepted from a client.
#[derive(Debug, Clone)]
pub struct Published {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    pub async fn start() -> Result<Self> {
        Self::with_config(MockServerConfig::default()).await
    }

    pub async fn with_config(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock server")?;
        let addr = listener.local_addr()?;
        let state = Arc::new(State::new(config, addr));
        let acceptor = tokio::spawn(accept_loop(listener, state.clone()));
        Ok(Self {
            addr,
            state,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        let scheme = if self.state.config.tls.is_some() {
            "tls"
        } else {
            "nats"
        };
        format!("{scheme}://{}", self.addr)
    }

    /// Stops accepting and drops every live connection.
    pub fn stop(&self) {
        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.abort();
        }
        self.kill_connections();
    }

    /// Listens again on the same address after [`MockServer::stop`].
    pub async fn restart(&self) -> Result<()> {
        self.stop();
        let mut attempts = 0;
        let listener = loop {
            match TcpListener::bind(self.addr).await {
                Ok(listener) => break listener,
                Err(err) if attempts < 50 => {
                    attempts += 1;
                    tracing::debug!(error = %err, "rebind pending");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(err) => return Err(err).context("rebind mock server"),
            }
        };
        *self.acceptor.lock() = Some(tokio::spawn(accept_loop(listener, self.state.clone())));
        Ok(())
    }

    /// Abruptly closes every client socket, leaving the listener up.
    pub fn kill_connections(&self) {
        for conn in self.state.conns.lock().values() {
            conn.kill.notify_one();
        }
    }

    pub fn connections_accepted(&self) -> u64 {
        self.state.accepted.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.state.conns.lock().len()
    }

    pub fn connects(&self) -> Vec<ConnectInfo> {
        self.state.connects.lock().clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.published.lock().clone()
    }

    pub fn pings_received(&self) -> u64 {
        self.state.pings.load(Ordering::Relaxed)
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .conns
            .lock()
            .values()
            .map(|conn| conn.subs.len())
            .sum()
    }

    /// Waits until at least `count` messages were published, returning them all.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<Published> {
        let _ = self
            .wait_until(timeout, || self.state.published.lock().len() >= count)
            .await;
        self.published()
    }

    pub async fn wait_for_subscriptions(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.subscription_count() >= count)
            .await
    }

    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            self.state
                .conns
                .lock()
                .values()
                .filter(|conn| conn.connect.is_some())
                .count()
                >= count
        })
        .await
    }

    async fn wait_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// When disabled, PINGs go unanswered (simulates a stalled server).
    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::Relaxed);
    }

    /// Writes raw protocol bytes to every connected client.
    pub fn send_raw(&self, bytes: &[u8]) {
        let chunk = Bytes::copy_from_slice(bytes);
        for conn in self.state.conns.lock().values() {
            let _ = conn.tx.send(chunk.clone());
        }
    }

    /// Broadcasts a fresh INFO after applying `update` to the advertised info.
    pub fn send_info(&self, update: impl FnOnce(&mut ServerInfo)) {
        let mut info = self.state.base_info();
        update(&mut info);
        let mut buf = BytesMut::new();
        if ServerOp::Info(Box::new(info)).encode(&mut buf).is_ok() {
            self.send_raw(&buf);
        }
    }

    /// Delivers a server-originated message to matching subscriptions.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        self.state
            .route(None, subject, None, None, payload.into())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

struct MockSub {
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

struct Conn {
    tx: mpsc::UnboundedSender<Bytes>,
    kill: Arc<Notify>,
    connect: Option<ConnectInfo>,
    subs: HashMap<u64, MockSub>,
}

struct State {
    config: MockServerConfig,
    addr: SocketAddr,
    conns: Mutex<HashMap<u64, Conn>>,
    connects: Mutex<Vec<ConnectInfo>>,
    published: Mutex<Vec<Published>>,
    accepted: AtomicU64,
    pings: AtomicU64,
    answer_pings: AtomicBool,
}

impl State {
    fn new(config: MockServerConfig, addr: SocketAddr) -> Self {
        Self {
            config,
            addr,
            conns: Mutex::new(HashMap::new()),
            connects: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            accepted: AtomicU64::new(0),
            pings: AtomicU64::new(0),
            answer_pings: AtomicBool::new(true),
        }
    }

    fn base_info(&self) -> ServerInfo {
        ServerInfo {
            server_id: format!("MOCK{}", self.addr.port()),
            server_name: self.config.server_name.clone(),
            version: "2.10.0".to_string(),
            proto: 1,
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            max_payload: self.config.max_payload,
            connect_urls: self.config.connect_urls.clone(),
            auth_required: self.config.auth.is_some(),
            tls_required: self.config.tls.is_some(),
            tls_available: self.config.tls.is_some(),
            headers: true,
            nonce: self.config.nonce.clone(),
            client_id: None,
            lame_duck_mode: false,
        }
    }

    fn send(&self, conn_id: u64, op: ServerOp) {
        let mut buf = BytesMut::new();
        if op.encode(&mut buf).is_err() {
            return;
        }
        if let Some(conn) = self.conns.lock().get(&conn_id) {
            let _ = conn.tx.send(buf.freeze());
        }
    }

    // Returns false when the connection must be closed.
    fn handle(&self, conn_id: u64, op: ClientOp) -> bool {
        match op {
            ClientOp::Connect(connect) => {
                let connect = *connect;
                self.connects.lock().push(connect.clone());
                let accepted = self
                    .config
                    .auth
                    .as_ref()
                    .is_none_or(|auth| auth.accepts(&connect));
                if !accepted {
                    self.send(conn_id, ServerOp::Err("Authorization Violation".to_string()));
                    return false;
                }
                let verbose = connect.verbose;
                if let Some(conn) = self.conns.lock().get_mut(&conn_id) {
                    conn.connect = Some(connect);
                }
                if verbose {
                    self.send(conn_id, ServerOp::Ok);
                }
            }
            ClientOp::Publish {
                subject,
                reply,
                headers,
                payload,
            } => {
                let size = courier_wire::ops::publish_size(headers.as_ref(), &payload);
                if size > self.config.max_payload {
                    self.send(conn_id, ServerOp::Err("Maximum Payload Violation".to_string()));
                    return false;
                }
                self.published.lock().push(Published {
                    subject: subject.clone(),
                    reply: reply.clone(),
                    headers: headers.clone(),
                    payload: payload.clone(),
                });
                let delivered =
                    self.route(Some(conn_id), &subject, reply.as_deref(), headers, payload);
                if delivered == 0
                    && let Some(reply) = reply
                    && self.wants_no_responders(conn_id)
                {
                    let status = HeaderMap::with_status(StatusCode::NO_RESPONDERS, None);
                    self.route(None, &reply, None, Some(status), Bytes::new());
                }
            }
            ClientOp::Subscribe { subject, queue, sid } => {
                if let Some(conn) = self.conns.lock().get_mut(&conn_id) {
                    conn.subs.insert(
                        sid,
                        MockSub {
                            subject,
                            queue,
                            max: None,
                            delivered: 0,
                        },
                    );
                }
            }
            ClientOp::Unsubscribe { sid, max } => {
                if let Some(conn) = self.conns.lock().get_mut(&conn_id) {
                    match max {
                        Some(max) => {
                            let done = conn.subs.get_mut(&sid).is_some_and(|sub| {
                                sub.max = Some(max);
                                sub.delivered >= max
                            });
                            if done {
                                conn.subs.remove(&sid);
                            }
                        }
                        None => {
                            conn.subs.remove(&sid);
                        }
                    }
                }
            }
            ClientOp::Ping => {
                self.pings.fetch_add(1, Ordering::Relaxed);
                if self.answer_pings.load(Ordering::Relaxed) {
                    self.send(conn_id, ServerOp::Pong);
                }
            }
            ClientOp::Pong => {}
        }
        true
    }

    fn wants_no_responders(&self, conn_id: u64) -> bool {
        self.conns
            .lock()
            .get(&conn_id)
            .and_then(|conn| conn.connect.as_ref())
            .is_some_and(|connect| connect.headers && connect.no_responders)
    }

    // Delivers to plain subscribers and one member per queue group.
    fn route(
        &self,
        from: Option<u64>,
        subject: &str,
        reply: Option<&str>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> usize {
        let mut conns = self.conns.lock();
        let mut targets: Vec<(u64, u64)> = Vec::new();
        let mut groups: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
        for (conn_id, conn) in conns.iter() {
            let echo = conn.connect.as_ref().is_none_or(|connect| connect.echo);
            if from == Some(*conn_id) && !echo {
                continue;
            }
            for (sid, sub) in &conn.subs {
                if !subject_matches(&sub.subject, subject) {
                    continue;
                }
                match &sub.queue {
                    Some(queue) => groups
                        .entry(queue.clone())
                        .or_default()
                        .push((*conn_id, *sid)),
                    None => targets.push((*conn_id, *sid)),
                }
            }
        }
        for members in groups.into_values() {
            let pick = rand::random_range(0..members.len());
            targets.push(members[pick]);
        }

        for (conn_id, sid) in &targets {
            let Some(conn) = conns.get_mut(conn_id) else {
                continue;
            };
            let op = ServerOp::Message {
                subject: subject.to_string(),
                sid: *sid,
                reply: reply.map(str::to_string),
                headers: headers.clone(),
                payload: payload.clone(),
            };
            let mut buf = BytesMut::new();
            if op.encode(&mut buf).is_ok() {
                let _ = conn.tx.send(buf.freeze());
            }
            let exhausted = conn.subs.get_mut(sid).is_some_and(|sub| {
                sub.delivered += 1;
                sub.max.is_some_and(|max| sub.delivered >= max)
            });
            if exhausted {
                conn.subs.remove(sid);
            }
        }
        targets.len()
    }
}

/// NATS-style subject matching: `*` matches one token, a trailing `>` one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => {}
            (literal, Some(actual)) if literal == actual => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

async fn accept_loop(listener: TcpListener, state: Arc<State>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "mock accept failed");
                continue;
            }
        };
        let conn_id = state.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(state.clone(), stream, conn_id).await {
                tracing::debug!(%peer, error = %err, "mock connection ended");
            }
            state.conns.lock().remove(&conn_id);
        });
    }
}

async fn serve(state: Arc<State>, mut stream: TcpStream, conn_id: u64) -> Result<()> {
    let mut info = state.base_info();
    info.client_id = Some(conn_id);
    let mut greeting = BytesMut::new();
    ServerOp::Info(Box::new(info)).encode(&mut greeting)?;
    stream.write_all(&greeting).await?;

    let io: Box<dyn Io> = match &state.config.tls {
        Some(config) => {
            let acceptor = tokio_rustls::TlsAcceptor::from(config.clone());
            Box::new(acceptor.accept(stream).await.context("tls accept")?)
        }
        None => Box::new(stream),
    };
    let (reader, mut writer) = tokio::io::split(io);

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let kill = Arc::new(Notify::new());
    state.conns.lock().insert(
        conn_id,
        Conn {
            tx,
            kill: kill.clone(),
            connect: None,
            subs: HashMap::new(),
        },
    );

    let mut write_task = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if writer.write_all(&chunk).await.is_err() {
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut frames = FramedRead::new(reader, ServerCodec::new());
    let killed = loop {
        tokio::select! {
            _ = kill.notified() => break true,
            frame = frames.next() => match frame {
                Some(Ok(op)) => {
                    if !state.handle(conn_id, op) {
                        break false;
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(conn_id, error = %err, "mock parse error");
                    state.send(conn_id, ServerOp::Err("Parser Error".to_string()));
                    break false;
                }
                None => break false,
            },
        }
    };

    // Dropping the registry entry closes the writer's channel.
    state.conns.lock().remove(&conn_id);
    if killed {
        write_task.abort();
    } else {
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut write_task).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("foo.bar", "foo.bar"));
        assert!(subject_matches("foo.*", "foo.bar"));
        assert!(!subject_matches("foo.*", "foo.bar.baz"));
        assert!(subject_matches("foo.>", "foo.bar.baz"));
        assert!(!subject_matches("foo.>", "foo"));
        assert!(!subject_matches("foo.bar", "foo"));
        assert!(subject_matches("_INBOX.abc.*", "_INBOX.abc.7"));
    }
}
