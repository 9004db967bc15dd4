// One transport's lifetime: handshake, read loop, flusher and keepalive.
//
// A session ends in one of three ways. `Closed` when the client shuts down,
// `Lost` when the transport fails in a way a reconnect can fix, and `Fatal`
// for protocol or authorization errors that must not be retried.
use bytes::BytesMut;
use courier_transport::{ServerAddr, Transport, connect_tcp};
use courier_wire::ops::{PING, PONG, encode_connect};
use courier_wire::{ClientCodec, ServerInfo, ServerOp};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::auth::{ServerErrorKind, build_connect_info, classify_server_error};
use crate::client::client::ClientInner;
use crate::client::event_router::ClientEvent;
use crate::client::outbound::FrameKind;
use crate::client::subscription::Dispatched;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::wire::{log_decode_error, read_server_op, write_flush};

/// A transport that finished the CONNECT/PING/PONG exchange.
pub(crate) struct Established {
    pub(crate) addr: ServerAddr,
    pub(crate) info: ServerInfo,
    reader: FramedRead<ReadHalf<Transport>, ClientCodec>,
    writer: WriteHalf<Transport>,
}

#[derive(Debug)]
pub(crate) enum SessionEnd {
    Closed,
    Lost(Error),
    Fatal(Error),
}

/// Connects to `addr` and completes the handshake within the connect timeout.
pub(crate) async fn establish(options: &Options, addr: &ServerAddr) -> Result<Established> {
    let stream = connect_tcp(addr, options.connect_timeout).await?;
    match tokio::time::timeout(options.connect_timeout, handshake(options, addr, stream)).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectionLost(format!(
            "handshake timed out after {:?}",
            options.connect_timeout
        ))),
    }
}

async fn handshake(
    options: &Options,
    addr: &ServerAddr,
    mut stream: tokio::net::TcpStream,
) -> Result<Established> {
    let mut codec = ClientCodec::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut info = match read_server_op(&mut stream, &mut codec, &mut buf).await? {
        ServerOp::Info(info) => *info,
        ServerOp::Err(message) => return Err(handshake_error(message)),
        other => {
            return Err(Error::Protocol(format!(
                "expected INFO as first op, got {other:?}"
            )));
        }
    };

    let wants_tls = info.tls_required
        || options.tls_required
        || addr.tls_required()
        || options.tls.is_some();
    let mut transport = if wants_tls {
        // Nothing may precede the TLS handshake once INFO has been read.
        buf.clear();
        let tls = options.tls.clone().unwrap_or_default();
        Transport::upgrade(stream, addr.host(), &tls).await?
    } else {
        Transport::Tcp(stream)
    };

    let connect = build_connect_info(options, &info, addr)?;
    let mut out = BytesMut::new();
    encode_connect(&mut out, &connect)?;
    out.extend_from_slice(PING);
    write_flush(&mut transport, &out).await?;

    loop {
        match read_server_op(&mut transport, &mut codec, &mut buf).await? {
            ServerOp::Pong => break,
            ServerOp::Ok => {}
            ServerOp::Info(update) => info = *update,
            ServerOp::Ping => write_flush(&mut transport, PONG).await?,
            ServerOp::Err(message) => return Err(handshake_error(message)),
            ServerOp::Message { subject, .. } => {
                return Err(Error::Protocol(format!(
                    "message on {subject} before handshake completed"
                )));
            }
        }
    }
    tracing::debug!(server = %addr, tls = transport.is_tls(), "handshake complete");

    let (read_half, writer) = tokio::io::split(transport);
    let mut reader = FramedRead::new(read_half, codec);
    reader.read_buffer_mut().extend_from_slice(&buf);
    Ok(Established {
        addr: addr.clone(),
        info,
        reader,
        writer,
    })
}

fn handshake_error(message: String) -> Error {
    match classify_server_error(&message) {
        ServerErrorKind::Authorization => Error::Authorization(message),
        ServerErrorKind::Stale => Error::ConnectionLost(message),
        ServerErrorKind::Permissions | ServerErrorKind::Other => Error::Server(message),
    }
}

/// Drives an established transport until it ends.
pub(crate) async fn run_session(inner: &Arc<ClientInner>, session: Established) -> SessionEnd {
    let Established {
        addr,
        mut reader,
        writer,
        ..
    } = session;
    // Independent of `shutdown` so the drain below runs after the read loop stops.
    let cancel = CancellationToken::new();
    let mut flusher = tokio::spawn(flush_loop(inner.clone(), writer, cancel.clone()));
    let pings_out = AtomicU32::new(0);
    let mut ticker = keepalive(inner.options.ping_interval);

    let end = loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break SessionEnd::Closed,
            _ = tick(&mut ticker) => {
                let outstanding = pings_out.fetch_add(1, Ordering::AcqRel) + 1;
                if outstanding > inner.options.max_pings_outstanding {
                    break SessionEnd::Lost(Error::ConnectionLost("stale connection".to_string()));
                }
                inner.outbound.ping();
            }
            result = &mut flusher => {
                break match result {
                    Ok(Ok(())) => SessionEnd::Lost(Error::ConnectionLost("writer stopped".to_string())),
                    Ok(Err(err)) => SessionEnd::Lost(err),
                    Err(err) => SessionEnd::Lost(Error::ConnectionLost(format!("writer task failed: {err}"))),
                };
            }
            frame = reader.next() => match frame {
                None => break SessionEnd::Lost(Error::ConnectionLost("server closed the connection".to_string())),
                Some(Err(courier_wire::Error::Io(err))) => break SessionEnd::Lost(err.into()),
                Some(Err(err)) => {
                    log_decode_error("read loop", &err, reader.decoder().last_line());
                    break SessionEnd::Fatal(Error::Protocol(err.to_string()));
                }
                Some(Ok(op)) => {
                    if let Some(end) = process(inner, op, &pings_out) {
                        break end;
                    }
                }
            }
        }
    };

    match &end {
        SessionEnd::Closed => {
            cancel.cancel();
            // Final best-effort drain of what was queued before close.
            match tokio::time::timeout(inner.options.flush_timeout, &mut flusher).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::debug!(server = %addr, "final drain timed out");
                    flusher.abort();
                }
            }
        }
        SessionEnd::Lost(err) | SessionEnd::Fatal(err) => {
            tracing::debug!(server = %addr, error = %err, "session ended");
            cancel.cancel();
            flusher.abort();
        }
    }
    end
}

fn keepalive(interval: std::time::Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handles one inbound op. Returns the session end it triggers, if any.
pub(crate) fn process(
    inner: &ClientInner,
    op: ServerOp,
    pings_out: &AtomicU32,
) -> Option<SessionEnd> {
    match op {
        ServerOp::Message {
            subject,
            sid,
            reply,
            headers,
            payload,
        } => {
            let msg = Message {
                subject,
                reply,
                headers,
                payload,
            };
            inner.stats.record_in(msg.pending_size());
            deliver(inner, sid, msg);
            None
        }
        ServerOp::Ping => {
            let _ = inner.outbound.enqueue(FrameKind::Control, PONG);
            None
        }
        ServerOp::Pong => {
            pings_out.store(0, Ordering::Release);
            inner.outbound.on_pong();
            None
        }
        ServerOp::Ok => None,
        ServerOp::Info(info) => {
            inner.apply_info(*info, true);
            None
        }
        ServerOp::Err(message) => match classify_server_error(&message) {
            ServerErrorKind::Authorization => Some(SessionEnd::Fatal(Error::Authorization(message))),
            ServerErrorKind::Stale => Some(SessionEnd::Lost(Error::ConnectionLost(message))),
            ServerErrorKind::Permissions => {
                tracing::warn!(error = %message, "server rejected an operation");
                inner.events.emit(ClientEvent::ServerError(message));
                None
            }
            ServerErrorKind::Other => Some(SessionEnd::Fatal(Error::Server(message))),
        },
    }
}

fn deliver(inner: &ClientInner, sid: u64, msg: Message) {
    let (outcome, entry) = inner.registry.dispatch(sid, msg);
    match outcome {
        Dispatched::Delivered => {}
        Dispatched::Request(reply) => {
            inner.requests.resolve(reply);
        }
        Dispatched::SlowConsumer { first } => {
            inner.stats.record_dropped();
            if first && let Some(entry) = entry {
                tracing::warn!(sid, subject = %entry.subject, "slow consumer, dropping messages");
                inner.events.emit(ClientEvent::SlowConsumer {
                    sid,
                    subject: entry.subject.clone(),
                });
            }
        }
        Dispatched::Unknown => {
            tracing::trace!(sid, "message for unknown subscription");
        }
    }
}

/// Writes whatever the outbound buffer holds. One task per transport.
async fn flush_loop(
    inner: Arc<ClientInner>,
    mut writer: WriteHalf<Transport>,
    cancel: CancellationToken,
) -> Result<()> {
    let outbound = &inner.outbound;
    let interval = inner.options.flush_interval;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let rest = outbound.take_pending();
                if !rest.is_empty() {
                    let _ = writer.write_all(&rest).await;
                }
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                return Ok(());
            }
            _ = outbound.wait_for_data() => {}
        }
        if !interval.is_zero() && outbound.pending_len() < outbound.threshold() {
            let _ = tokio::time::timeout(interval, outbound.wait_urgent()).await;
        }
        let batch = outbound.take_pending();
        if batch.is_empty() {
            continue;
        }
        writer.write_all(&batch).await?;
        writer.flush().await?;
    }
}
