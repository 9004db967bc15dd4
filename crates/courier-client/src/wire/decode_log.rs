// Decode error logging for server traffic.
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};

static DECODE_ERROR_LOGS: AtomicUsize = AtomicUsize::new(0);

const DECODE_ERROR_LOG_LIMIT: usize = 20;
const PREVIEW_LEN: usize = 64;

/// Logs a decode failure with a preview of the control line that failed.
/// Only the first few failures per process are logged.
pub(crate) fn log_decode_error(context: &str, err: &dyn Display, line: &[u8]) {
    let count = DECODE_ERROR_LOGS.fetch_add(1, Ordering::Relaxed);
    if count >= DECODE_ERROR_LOG_LIMIT {
        return;
    }
    let preview = &line[..line.len().min(PREVIEW_LEN)];
    let hex = preview
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    let printable = preview
        .iter()
        .map(|b| {
            let c = *b as char;
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            }
        })
        .collect::<String>();
    tracing::warn!(
        context,
        error = %err,
        line_len = line.len(),
        preview_hex = %hex,
        preview_printable = %printable,
        "courier-client decode error"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_decode_error_does_not_panic() {
        log_decode_error("test_context", &"bad op", b"BOGUS\r\n");
    }

    #[test]
    fn log_decode_error_with_non_printable_bytes() {
        log_decode_error("binary_data", &"bad op", &[0x00, 0x01, 0x02, 0xFF, b'A', b'B']);
    }

    #[test]
    fn log_decode_error_with_large_buffer() {
        let mut data = vec![b'X'; 200];
        data[50] = 0x00;
        log_decode_error("large_buffer", &"bad op", &data);
    }

    #[test]
    fn log_decode_error_with_empty_buffer() {
        log_decode_error("empty", &"bad op", &[]);
    }
}
