// Message headers carried by HPUB/HMSG.
use bytes::{BufMut, BytesMut};
use std::fmt;

use crate::{Error, Result};

pub const HEADER_LINE: &str = "NATS/1.0";

/// Inline status carried on the header version line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const IDLE_HEARTBEAT: StatusCode = StatusCode(100);
    pub const OK: StatusCode = StatusCode(200);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const NO_RESPONDERS: StatusCode = StatusCode(503);

    pub fn new(code: u16) -> Result<Self> {
        if !(100..1000).contains(&code) {
            return Err(Error::InvalidHeader(format!("status {code} out of range")));
        }
        Ok(Self(code))
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered, multi-valued header map.
///
/// Entries keep insertion order and a key may appear several times, so a
/// decoded block re-encodes to the same bytes.
///
/// ```
/// use courier_wire::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.append("Trace-Id", "abc");
/// headers.append("Hop", "a");
/// headers.append("Hop", "b");
/// assert_eq!(headers.get("Trace-Id"), Some("abc"));
/// assert_eq!(headers.get_all("Hop").collect::<Vec<_>>(), vec!["a", "b"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status: Option<StatusCode>,
    description: Option<String>,
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: StatusCode, description: Option<&str>) -> Self {
        Self {
            status: Some(status),
            description: description.map(str::to_string),
            entries: Vec::new(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Adds a value, keeping any existing values for the same key.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with `value`, in the position of the
    /// first existing entry.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(key, _)| *key == name) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(key, _)| {
                    let keep = index <= first || *key != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(key, _)| key != name);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Writes the header block, including the trailing blank line.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(HEADER_LINE.as_bytes());
        if let Some(status) = self.status {
            dst.put_u8(b' ');
            dst.put_slice(status.to_string().as_bytes());
            if let Some(description) = &self.description {
                if contains_line_break(description) {
                    return Err(Error::InvalidHeader("description contains CR/LF".into()));
                }
                dst.put_u8(b' ');
                dst.put_slice(description.as_bytes());
            }
        }
        dst.put_slice(b"\r\n");
        for (key, value) in &self.entries {
            if key.is_empty()
                || key.contains(':')
                || key.bytes().any(|b| b.is_ascii_whitespace())
            {
                return Err(Error::InvalidHeader(format!("bad header name {key:?}")));
            }
            if contains_line_break(value) {
                return Err(Error::InvalidHeader(format!("bad value for {key}")));
            }
            dst.put_slice(key.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_LINE.len() + 2;
        if self.status.is_some() {
            len += 4;
            if let Some(description) = &self.description {
                len += 1 + description.len();
            }
        }
        for (key, value) in &self.entries {
            len += key.len() + 2 + value.len() + 2;
        }
        len + 2
    }

    /// Parses a header block as it appears at the front of an HMSG payload.
    pub fn decode(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| Error::InvalidHeader("header block is not utf-8".into()))?;
        let mut lines = text.split("\r\n");
        let version_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHeader("empty header block".into()))?;
        let rest = version_line
            .strip_prefix(HEADER_LINE)
            .ok_or_else(|| Error::InvalidHeader(format!("bad version line {version_line:?}")))?;

        let mut headers = HeaderMap::new();
        let rest = rest.trim_start();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(' ') {
                Some((code, description)) => (code, Some(description.trim())),
                None => (rest, None),
            };
            let code = code
                .parse::<u16>()
                .map_err(|_| Error::InvalidHeader(format!("bad status {code:?}")))?;
            headers.status = Some(StatusCode::new(code)?);
            headers.description = description
                .filter(|description| !description.is_empty())
                .map(str::to_string);
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidHeader(format!("malformed line {line:?}")))?;
            if key.is_empty() {
                return Err(Error::InvalidHeader(format!("malformed line {line:?}")));
            }
            headers.append(key, value.trim_start());
        }
        Ok(headers)
    }
}

fn contains_line_break(value: &str) -> bool {
    value.bytes().any(|b| b == b'\r' || b == b'\n')
}
