// Client error kinds and their effect on the connection.
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Malformed traffic from the server. Closes the connection.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("slow consumer on sid {sid} ({subject}), message dropped")]
    SlowConsumer { sid: u64, subject: String },
    #[error("no responders available for request")]
    NoResponders,
    #[error("payload of {size} bytes exceeds server maximum of {max}")]
    MaxPayloadExceeded { size: usize, max: usize },
    #[error("reconnect buffer full")]
    ReconnectBufferExceeded,
    #[error("no servers available")]
    NoServers,
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("subscription closed")]
    SubscriptionClosed,
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("transport: {0}")]
    Transport(String),
    #[error("io: {0}")]
    Io(String),
    /// An `-ERR` the server sent that did not map to a more specific kind.
    #[error("server error: {0}")]
    Server(String),
}

impl Error {
    /// Errors that close the connection without a reconnect attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Authorization(_) | Error::Server(_)
        )
    }

    /// Transport-level failures that drive the reconnect loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::Transport(_) | Error::Io(_)
        )
    }
}

impl From<courier_wire::Error> for Error {
    fn from(err: courier_wire::Error) -> Self {
        match err {
            courier_wire::Error::InvalidSubject(subject) => Error::InvalidSubject(subject),
            courier_wire::Error::InvalidHeader(reason) => Error::InvalidHeader(reason),
            courier_wire::Error::Io(err) => Error::Io(err.to_string()),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<courier_transport::TransportError> for Error {
    fn from(err: courier_transport::TransportError) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
