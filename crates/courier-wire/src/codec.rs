// Incremental decoders for both directions of the protocol.
//
// Each decoder is a two-state machine: waiting for a control line, or waiting
// for the declared payload of the previous line. State survives across calls,
// so a frame may arrive split at any byte boundary.
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::headers::HeaderMap;
use crate::info::{ConnectInfo, ServerInfo};
use crate::ops::{ClientOp, ServerOp};
use crate::{Error, MAX_CONTROL_LINE, MAX_INFO_LINE, Result};

const RESERVE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
struct PayloadSizes {
    header_len: Option<usize>,
    total: usize,
}

#[derive(Debug)]
struct PendingMessage {
    subject: String,
    sid: u64,
    reply: Option<String>,
    sizes: PayloadSizes,
}

#[derive(Debug)]
struct PendingPublish {
    subject: String,
    reply: Option<String>,
    sizes: PayloadSizes,
}

/// Client side codec: decodes [`ServerOp`], encodes [`ClientOp`].
#[derive(Debug, Default)]
pub struct ClientCodec {
    pending: Option<PendingMessage>,
    last_line: Bytes,
}

/// Server side codec: decodes [`ClientOp`], encodes [`ServerOp`].
#[derive(Debug, Default)]
pub struct ServerCodec {
    pending: Option<PendingPublish>,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a MSG/HMSG control line has been read but its payload has not.
    pub fn is_mid_frame(&self) -> bool {
        self.pending.is_some()
    }

    /// The most recent control line taken off the stream, without its CRLF.
    /// After a decode error this is the line that failed.
    pub fn last_line(&self) -> &[u8] {
        &self.last_line
    }
}

impl ServerCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ClientCodec {
    type Item = ServerOp;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>> {
        loop {
            if let Some(pending) = self.pending.take() {
                let Some((headers, payload)) = take_payload(src, pending.sizes)? else {
                    self.pending = Some(pending);
                    return Ok(None);
                };
                return Ok(Some(ServerOp::Message {
                    subject: pending.subject,
                    sid: pending.sid,
                    reply: pending.reply,
                    headers,
                    payload,
                }));
            }

            let limit = server_line_limit(src);
            let Some(line) = take_line(src, limit)? else {
                return Ok(None);
            };
            let line = line.freeze();
            self.last_line = line.clone();
            let (verb, rest) = split_verb(&line)?;
            match verb.as_str() {
                "MSG" => {
                    let args = split_args(rest);
                    let (subject, sid, reply, size) = match args.as_slice() {
                        [subject, sid, size] => (*subject, *sid, None, *size),
                        [subject, sid, reply, size] => (*subject, *sid, Some(*reply), *size),
                        _ => return Err(Error::protocol(format!("malformed MSG: {rest}"))),
                    };
                    self.pending = Some(PendingMessage {
                        subject: subject.to_string(),
                        sid: parse_u64(sid, "sid")?,
                        reply: reply.map(str::to_string),
                        sizes: PayloadSizes {
                            header_len: None,
                            total: parse_size(size, "payload size")?,
                        },
                    });
                }
                "HMSG" => {
                    let args = split_args(rest);
                    let (subject, sid, reply, header_len, total) = match args.as_slice() {
                        [subject, sid, hdr, total] => (*subject, *sid, None, *hdr, *total),
                        [subject, sid, reply, hdr, total] => {
                            (*subject, *sid, Some(*reply), *hdr, *total)
                        }
                        _ => return Err(Error::protocol(format!("malformed HMSG: {rest}"))),
                    };
                    self.pending = Some(PendingMessage {
                        subject: subject.to_string(),
                        sid: parse_u64(sid, "sid")?,
                        reply: reply.map(str::to_string),
                        sizes: header_sizes(header_len, total)?,
                    });
                }
                "PING" => return Ok(Some(ServerOp::Ping)),
                "PONG" => return Ok(Some(ServerOp::Pong)),
                "+OK" => return Ok(Some(ServerOp::Ok)),
                "-ERR" => return Ok(Some(ServerOp::Err(unquote(rest).to_string()))),
                "INFO" => {
                    let info: ServerInfo =
                        serde_json::from_str(rest).map_err(|source| Error::Json {
                            op: "INFO",
                            source,
                        })?;
                    return Ok(Some(ServerOp::Info(Box::new(info))));
                }
                other => return Err(Error::protocol(format!("unknown server op {other:?}"))),
            }
        }
    }
}

impl Encoder<ClientOp> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, item: ClientOp, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}

impl Decoder for ServerCodec {
    type Item = ClientOp;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientOp>> {
        loop {
            if let Some(pending) = self.pending.take() {
                let Some((headers, payload)) = take_payload(src, pending.sizes)? else {
                    self.pending = Some(pending);
                    return Ok(None);
                };
                return Ok(Some(ClientOp::Publish {
                    subject: pending.subject,
                    reply: pending.reply,
                    headers,
                    payload,
                }));
            }

            let Some(line) = take_line(src, MAX_CONTROL_LINE)? else {
                return Ok(None);
            };
            let (verb, rest) = split_verb(&line)?;
            match verb.as_str() {
                "PUB" => {
                    let args = split_args(rest);
                    let (subject, reply, size) = match args.as_slice() {
                        [subject, size] => (*subject, None, *size),
                        [subject, reply, size] => (*subject, Some(*reply), *size),
                        _ => return Err(Error::protocol(format!("malformed PUB: {rest}"))),
                    };
                    self.pending = Some(PendingPublish {
                        subject: subject.to_string(),
                        reply: reply.map(str::to_string),
                        sizes: PayloadSizes {
                            header_len: None,
                            total: parse_size(size, "payload size")?,
                        },
                    });
                }
                "HPUB" => {
                    let args = split_args(rest);
                    let (subject, reply, header_len, total) = match args.as_slice() {
                        [subject, hdr, total] => (*subject, None, *hdr, *total),
                        [subject, reply, hdr, total] => (*subject, Some(*reply), *hdr, *total),
                        _ => return Err(Error::protocol(format!("malformed HPUB: {rest}"))),
                    };
                    self.pending = Some(PendingPublish {
                        subject: subject.to_string(),
                        reply: reply.map(str::to_string),
                        sizes: header_sizes(header_len, total)?,
                    });
                }
                "SUB" => {
                    let args = split_args(rest);
                    let (subject, queue, sid) = match args.as_slice() {
                        [subject, sid] => (*subject, None, *sid),
                        [subject, queue, sid] => (*subject, Some(*queue), *sid),
                        _ => return Err(Error::protocol(format!("malformed SUB: {rest}"))),
                    };
                    return Ok(Some(ClientOp::Subscribe {
                        subject: subject.to_string(),
                        queue: queue.map(str::to_string),
                        sid: parse_u64(sid, "sid")?,
                    }));
                }
                "UNSUB" => {
                    let args = split_args(rest);
                    let (sid, max) = match args.as_slice() {
                        [sid] => (*sid, None),
                        [sid, max] => (*sid, Some(parse_u64(max, "max msgs")?)),
                        _ => return Err(Error::protocol(format!("malformed UNSUB: {rest}"))),
                    };
                    return Ok(Some(ClientOp::Unsubscribe {
                        sid: parse_u64(sid, "sid")?,
                        max,
                    }));
                }
                "CONNECT" => {
                    let info: ConnectInfo =
                        serde_json::from_str(rest).map_err(|source| Error::Json {
                            op: "CONNECT",
                            source,
                        })?;
                    return Ok(Some(ClientOp::Connect(Box::new(info))));
                }
                "PING" => return Ok(Some(ClientOp::Ping)),
                "PONG" => return Ok(Some(ClientOp::Pong)),
                other => return Err(Error::protocol(format!("unknown client op {other:?}"))),
            }
        }
    }
}

impl Encoder<ServerOp> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, item: ServerOp, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}

// INFO carries the cluster's connect_urls and may outgrow an ordinary line.
fn server_line_limit(src: &[u8]) -> usize {
    match src.get(..4) {
        Some(verb) if verb.eq_ignore_ascii_case(b"INFO") => MAX_INFO_LINE,
        _ => MAX_CONTROL_LINE,
    }
}

// Splits off one CRLF-terminated control line (without the terminator).
fn take_line(src: &mut BytesMut, limit: usize) -> Result<Option<BytesMut>> {
    let window = src.len().min(limit + 2);
    match src[..window].windows(2).position(|pair| pair == b"\r\n") {
        Some(end) => {
            let line = src.split_to(end);
            src.advance(2);
            Ok(Some(line))
        }
        None if src.len() > limit => Err(Error::protocol(format!(
            "control line exceeds {limit} bytes"
        ))),
        None => Ok(None),
    }
}

fn take_payload(
    src: &mut BytesMut,
    sizes: PayloadSizes,
) -> Result<Option<(Option<HeaderMap>, Bytes)>> {
    let needed = sizes.total + 2;
    if src.len() < needed {
        // Grow towards the declared size without trusting it for one huge allocation.
        src.reserve((needed - src.len()).min(RESERVE_CHUNK));
        return Ok(None);
    }
    let body = src.split_to(sizes.total).freeze();
    if &src[..2] != b"\r\n" {
        return Err(Error::protocol("payload not terminated by CRLF"));
    }
    src.advance(2);
    match sizes.header_len {
        Some(header_len) => {
            // Headers are decoded before the payload is handed out.
            let headers = HeaderMap::decode(&body[..header_len])?;
            Ok(Some((Some(headers), body.slice(header_len..))))
        }
        None => Ok(Some((None, body))),
    }
}

fn split_verb(line: &[u8]) -> Result<(String, &str)> {
    let text =
        std::str::from_utf8(line).map_err(|_| Error::protocol("control line is not utf-8"))?;
    let text = text.trim_start();
    let (verb, rest) = match text.find([' ', '\t']) {
        Some(index) => (&text[..index], text[index..].trim()),
        None => (text.trim_end(), ""),
    };
    if verb.is_empty() {
        return Err(Error::protocol("empty control line"));
    }
    Ok((verb.to_ascii_uppercase(), rest))
}

fn split_args(rest: &str) -> Vec<&str> {
    rest.split([' ', '\t']).filter(|arg| !arg.is_empty()).collect()
}

fn header_sizes(header_len: &str, total: &str) -> Result<PayloadSizes> {
    let header_len = parse_size(header_len, "header size")?;
    let total = parse_size(total, "total size")?;
    if header_len > total {
        return Err(Error::protocol(format!(
            "header size {header_len} exceeds total size {total}"
        )));
    }
    Ok(PayloadSizes {
        header_len: Some(header_len),
        total,
    })
}

// Sizes must be plain unsigned decimal; signs, spaces and overflow are fatal.
fn parse_size(token: &str, what: &str) -> Result<usize> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::protocol(format!("invalid {what} {token:?}")));
    }
    token
        .parse::<usize>()
        .map_err(|_| Error::protocol(format!("{what} out of range: {token}")))
}

fn parse_u64(token: &str, what: &str) -> Result<u64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::protocol(format!("invalid {what} {token:?}")));
    }
    token
        .parse::<u64>()
        .map_err(|_| Error::protocol(format!("{what} out of range: {token}")))
}

fn unquote(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
        .unwrap_or(text)
}
