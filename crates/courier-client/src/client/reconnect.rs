// Supervisor task: runs sessions back to back and reconnects between them.
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::client::client::{ClientInner, ConnectionState};
use crate::client::connection::{Established, SessionEnd, establish, run_session};

/// Owns the connection until close. `session` is the transport from the
/// initial connect, absent when that failed and retrying was requested.
pub(crate) async fn supervise(inner: Arc<ClientInner>, mut session: Option<Established>) {
    let mut connected_once = session.is_some();
    loop {
        if let Some(live) = session.take() {
            match run_session(&inner, live).await {
                SessionEnd::Closed => break,
                SessionEnd::Fatal(err) => {
                    error!(error = %err, "connection failed permanently");
                    inner.record_error(&err);
                    break;
                }
                SessionEnd::Lost(err) => {
                    warn!(error = %err, "connection lost");
                    inner.record_error(&err);
                    inner.disconnected();
                    if !inner.options.allow_reconnect {
                        break;
                    }
                }
            }
        }

        inner.set_state(ConnectionState::Reconnecting);
        match reconnect(&inner).await {
            Some(live) => {
                inner.activate(&live, connected_once);
                connected_once = true;
                session = Some(live);
            }
            None => break,
        }
    }
    inner.finish_close();
}

/// Walks the pool until a server accepts, attempts run out, or the client
/// closes.
///
/// Each server waits out its own backoff, measured from its last attempt and
/// scaled by its consecutive failures. `max_reconnect_attempts` bounds the
/// attempts across the whole pool.
async fn reconnect(inner: &ClientInner) -> Option<Established> {
    let options = &inner.options;
    let mut attempts: u32 = 0;
    loop {
        if inner.shutdown.is_cancelled() {
            return None;
        }
        if let Some(max) = options.max_reconnect_attempts
            && attempts >= max
        {
            warn!(attempts, "reconnect attempts exhausted");
            return None;
        }
        let candidate = inner.pool.lock().next_candidate()?;

        if let Some(last) = candidate.last_attempt {
            let wait = options
                .reconnect_delay
                .delay(candidate.failures)
                .saturating_sub(last.elapsed());
            if !wait.is_zero() {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        attempts += 1;
        inner.pool.lock().report_attempt(&candidate.addr);
        let outcome = tokio::select! {
            _ = inner.shutdown.cancelled() => return None,
            outcome = establish(options, &candidate.addr) => outcome,
        };
        match outcome {
            Ok(live) => {
                inner.pool.lock().report_success(&candidate.addr);
                info!(server = %candidate.addr, attempts, "reconnected");
                return Some(live);
            }
            Err(err) if !err.is_retryable() => {
                error!(server = %candidate.addr, error = %err, "reconnect rejected");
                inner.record_error(&err);
                return None;
            }
            Err(err) => {
                warn!(server = %candidate.addr, attempt = attempts, error = %err, "reconnect attempt failed");
                inner.record_error(&err);
                inner.pool.lock().report_failure(&candidate.addr);
            }
        }
    }
}
