// Text wire protocol: control lines, payload framing, headers and handshake JSON.
//
// Every operation is a single control line terminated by CRLF. MSG/HMSG (server
// side) and PUB/HPUB (client side) are followed by a binary payload whose length
// is declared on the control line, itself terminated by CRLF.
//
// ```text
// MSG <subject> <sid> [reply] <#bytes>\r\n<payload>\r\n
// HMSG <subject> <sid> [reply] <#hdr-bytes> <#total-bytes>\r\n<headers><payload>\r\n
// ```
//
// Decoding is incremental: the decoders in `codec` implement
// `tokio_util::codec::Decoder` and may be fed arbitrarily small chunks.
pub mod codec;
pub mod headers;
pub mod info;
pub mod ops;

pub use codec::{ClientCodec, ServerCodec};
pub use headers::{HeaderMap, StatusCode};
pub use info::{ConnectInfo, ServerInfo};
pub use ops::{ClientOp, ServerOp};

/// Longest control line accepted before the peer is considered broken.
pub const MAX_CONTROL_LINE: usize = 4096;
/// Longest INFO line a client accepts; cluster URL lists can be long.
pub const MAX_INFO_LINE: usize = 64 * 1024;
/// Protocol version advertised in CONNECT.
pub const PROTOCOL_VERSION: u8 = 1;
pub const CRLF: &[u8] = b"\r\n";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid json in {op}")]
    Json {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// Checks that a subject is a non-empty sequence of non-empty, whitespace free
/// tokens separated by `.`.
///
/// ```
/// use courier_wire::validate_subject;
///
/// assert!(validate_subject("orders.eu.created").is_ok());
/// assert!(validate_subject("orders..created").is_err());
/// assert!(validate_subject("with space").is_err());
/// ```
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty()
        || subject.split('.').any(str::is_empty)
        || subject.bytes().any(|b| b.is_ascii_whitespace())
    {
        return Err(Error::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Queue group names are single tokens.
pub fn validate_queue(queue: &str) -> Result<()> {
    if queue.is_empty() || queue.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(Error::InvalidSubject(queue.to_string()));
    }
    Ok(())
}
