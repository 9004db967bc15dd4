// Inbound message delivered to a subscription or returned by a request.
use bytes::Bytes;
use courier_wire::{HeaderMap, StatusCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
}

impl Message {
    pub fn status(&self) -> Option<StatusCode> {
        self.headers.as_ref().and_then(HeaderMap::status)
    }

    /// The broker's answer to a request nobody was subscribed to.
    pub fn is_no_responders(&self) -> bool {
        self.payload.is_empty() && self.status() == Some(StatusCode::NO_RESPONDERS)
    }

    /// Bytes counted against pending-bytes limits.
    pub(crate) fn pending_size(&self) -> usize {
        self.payload.len() + self.headers.as_ref().map_or(0, HeaderMap::encoded_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_responders_requires_status_and_empty_payload() {
        let mut msg = Message {
            subject: "_INBOX.a.1".into(),
            reply: None,
            headers: Some(HeaderMap::with_status(StatusCode::NO_RESPONDERS, None)),
            payload: Bytes::new(),
        };
        assert!(msg.is_no_responders());
        msg.payload = Bytes::from_static(b"late");
        assert!(!msg.is_no_responders());
        msg.headers = None;
        assert_eq!(msg.status(), None);
        assert_eq!(msg.pending_size(), 4);
    }
}
