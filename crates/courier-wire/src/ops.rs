// Protocol operations and their encodings.
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;

use crate::headers::HeaderMap;
use crate::info::{ConnectInfo, ServerInfo};
use crate::{Error, Result};

pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";
pub const OK: &[u8] = b"+OK\r\n";

/// Operations sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(Box<ConnectInfo>),
    /// PUB, or HPUB when `headers` is set.
    Publish {
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Subscribe {
        subject: String,
        queue: Option<String>,
        sid: u64,
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

/// Operations sent by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    /// MSG, or HMSG when `headers` is set.
    Message {
        subject: String,
        sid: u64,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

impl ClientOp {
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            ClientOp::Connect(info) => encode_connect(dst, info),
            ClientOp::Publish {
                subject,
                reply,
                headers,
                payload,
            } => encode_publish(dst, subject, reply.as_deref(), headers.as_ref(), payload),
            ClientOp::Subscribe { subject, queue, sid } => {
                encode_subscribe(dst, subject, queue.as_deref(), *sid);
                Ok(())
            }
            ClientOp::Unsubscribe { sid, max } => {
                encode_unsubscribe(dst, *sid, *max);
                Ok(())
            }
            ClientOp::Ping => {
                dst.put_slice(PING);
                Ok(())
            }
            ClientOp::Pong => {
                dst.put_slice(PONG);
                Ok(())
            }
        }
    }
}

impl ServerOp {
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            ServerOp::Info(info) => {
                let json = serde_json::to_string(info).map_err(|source| Error::Json {
                    op: "INFO",
                    source,
                })?;
                dst.put_slice(b"INFO ");
                dst.put_slice(json.as_bytes());
                dst.put_slice(b"\r\n");
                Ok(())
            }
            ServerOp::Message {
                subject,
                sid,
                reply,
                headers,
                payload,
            } => {
                let header_block = encode_header_block(headers.as_ref())?;
                let verb = if header_block.is_some() { "HMSG" } else { "MSG" };
                write_line_head(dst, verb, subject, &sid.to_string(), reply.as_deref());
                write_payload(dst, header_block, payload);
                Ok(())
            }
            ServerOp::Ping => {
                dst.put_slice(PING);
                Ok(())
            }
            ServerOp::Pong => {
                dst.put_slice(PONG);
                Ok(())
            }
            ServerOp::Ok => {
                dst.put_slice(OK);
                Ok(())
            }
            ServerOp::Err(message) => {
                let _ = write!(dst, "-ERR '{message}'\r\n");
                Ok(())
            }
        }
    }
}

pub fn encode_connect(dst: &mut BytesMut, info: &ConnectInfo) -> Result<()> {
    let json = serde_json::to_string(info).map_err(|source| Error::Json {
        op: "CONNECT",
        source,
    })?;
    dst.put_slice(b"CONNECT ");
    dst.put_slice(json.as_bytes());
    dst.put_slice(b"\r\n");
    Ok(())
}

/// Encodes PUB, or HPUB when a non-empty header map is given.
///
/// ```
/// use bytes::BytesMut;
/// use courier_wire::ops::encode_publish;
///
/// let mut buf = BytesMut::new();
/// encode_publish(&mut buf, "foo", Some("bar"), None, b"hello").expect("encode");
/// assert_eq!(&buf[..], b"PUB foo bar 5\r\nhello\r\n");
/// ```
pub fn encode_publish(
    dst: &mut BytesMut,
    subject: &str,
    reply: Option<&str>,
    headers: Option<&HeaderMap>,
    payload: &[u8],
) -> Result<()> {
    let header_block = encode_header_block(headers)?;
    let verb = if header_block.is_some() { "HPUB" } else { "PUB" };
    dst.reserve(subject.len() + payload.len() + 32);
    dst.put_slice(verb.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(subject.as_bytes());
    if let Some(reply) = reply {
        dst.put_u8(b' ');
        dst.put_slice(reply.as_bytes());
    }
    write_payload(dst, header_block, payload);
    Ok(())
}

pub fn encode_subscribe(dst: &mut BytesMut, subject: &str, queue: Option<&str>, sid: u64) {
    let _ = match queue {
        Some(queue) => write!(dst, "SUB {subject} {queue} {sid}\r\n"),
        None => write!(dst, "SUB {subject} {sid}\r\n"),
    };
}

pub fn encode_unsubscribe(dst: &mut BytesMut, sid: u64, max: Option<u64>) {
    let _ = match max {
        Some(max) => write!(dst, "UNSUB {sid} {max}\r\n"),
        None => write!(dst, "UNSUB {sid}\r\n"),
    };
}

/// Size of a PUB/HPUB payload as counted against the server's max_payload.
pub fn publish_size(headers: Option<&HeaderMap>, payload: &[u8]) -> usize {
    headers
        .filter(|headers| !headers.is_empty())
        .map(HeaderMap::encoded_len)
        .unwrap_or(0)
        + payload.len()
}

fn encode_header_block(headers: Option<&HeaderMap>) -> Result<Option<BytesMut>> {
    match headers {
        Some(headers) if !headers.is_empty() => {
            let mut block = BytesMut::with_capacity(headers.encoded_len());
            headers.encode_into(&mut block)?;
            Ok(Some(block))
        }
        _ => Ok(None),
    }
}

fn write_line_head(dst: &mut BytesMut, verb: &str, subject: &str, sid: &str, reply: Option<&str>) {
    dst.put_slice(verb.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(subject.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(sid.as_bytes());
    if let Some(reply) = reply {
        dst.put_u8(b' ');
        dst.put_slice(reply.as_bytes());
    }
}

// Appends ` [<hdr-len>] <total-len>\r\n<headers><payload>\r\n`.
fn write_payload(dst: &mut BytesMut, header_block: Option<BytesMut>, payload: &[u8]) {
    match header_block {
        Some(block) => {
            let _ = write!(dst, " {} {}\r\n", block.len(), block.len() + payload.len());
            dst.put_slice(&block);
        }
        None => {
            let _ = write!(dst, " {}\r\n", payload.len());
        }
    }
    dst.put_slice(payload);
    dst.put_slice(b"\r\n");
}
