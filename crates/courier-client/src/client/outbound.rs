// Outbound byte buffer, reconnect buffer and PING/PONG flush tracking.
//
// Publishers encode into a scratch buffer and only copy it in under the lock.
// A single flusher task per transport takes everything buffered and writes it
// with the lock released, so writes coalesce while one is in flight.
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{Notify, oneshot};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundMode {
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Survives a disconnect through the reconnect buffer.
    Publish,
    /// SUB/UNSUB/PONG: dropped while reconnecting, state is replayed instead.
    Control,
}

/// Append-only publish buffer used while reconnecting. The ceiling is never
/// exceeded; a zero ceiling disables buffering.
#[derive(Debug)]
pub(crate) struct ReconnectBuffer {
    data: BytesMut,
    frames: usize,
    ceiling: usize,
}

impl ReconnectBuffer {
    pub(crate) fn new(ceiling: usize) -> Self {
        Self {
            data: BytesMut::new(),
            frames: 0,
            ceiling,
        }
    }

    pub(crate) fn try_append(&mut self, frame: &[u8]) -> Result<()> {
        if self.data.len() + frame.len() > self.ceiling {
            return Err(Error::ReconnectBufferExceeded);
        }
        self.data.extend_from_slice(frame);
        self.frames += 1;
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn frames(&self) -> usize {
        self.frames
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self) -> BytesMut {
        self.frames = 0;
        self.data.split()
    }

    fn clear(&mut self) {
        self.frames = 0;
        self.data.clear();
    }
}

struct PongWaiter {
    seq: u64,
    tx: oneshot::Sender<Result<()>>,
}

struct OutboundState {
    mode: OutboundMode,
    pending: BytesMut,
    reconnect: ReconnectBuffer,
    // Frames enqueued on a live transport (plus buffered publishes), and the
    // highest count a PONG has confirmed.
    out_seq: u64,
    acked_seq: u64,
    // `out_seq` at the time each unanswered PING was queued, oldest first.
    pings: VecDeque<u64>,
    waiters: VecDeque<PongWaiter>,
}

impl OutboundState {
    fn queue_ping(&mut self) {
        self.pending.extend_from_slice(courier_wire::ops::PING);
        self.pings.push_back(self.out_seq);
    }
}

pub(crate) struct Outbound {
    state: Mutex<OutboundState>,
    threshold: usize,
    wake: Notify,
    urgent: Notify,
}

impl Outbound {
    pub(crate) fn new(reconnect_ceiling: usize, threshold: usize) -> Self {
        Self {
            state: Mutex::new(OutboundState {
                mode: OutboundMode::Reconnecting,
                pending: BytesMut::with_capacity(threshold),
                reconnect: ReconnectBuffer::new(reconnect_ceiling),
                out_seq: 0,
                acked_seq: 0,
                pings: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            threshold,
            wake: Notify::new(),
            urgent: Notify::new(),
        }
    }

    pub(crate) fn mode(&self) -> OutboundMode {
        self.state.lock().mode
    }

    pub(crate) fn enqueue(&self, kind: FrameKind, frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        match (state.mode, kind) {
            (OutboundMode::Closed, _) => return Err(Error::ConnectionClosed),
            (OutboundMode::Reconnecting, FrameKind::Control) => return Ok(()),
            (OutboundMode::Reconnecting, FrameKind::Publish) => {
                state.reconnect.try_append(frame)?;
                state.out_seq += 1;
                return Ok(());
            }
            (OutboundMode::Connected, _) => {
                state.pending.extend_from_slice(frame);
                state.out_seq += 1;
            }
        }
        let over_threshold = state.pending.len() >= self.threshold;
        drop(state);
        self.wake.notify_one();
        if over_threshold {
            self.urgent.notify_one();
        }
        Ok(())
    }

    /// Queues a keepalive PING. Returns false when not connected.
    pub(crate) fn ping(&self) -> bool {
        let mut state = self.state.lock();
        if state.mode != OutboundMode::Connected {
            return false;
        }
        state.queue_ping();
        drop(state);
        self.wake.notify_one();
        self.urgent.notify_one();
        true
    }

    /// Registers a flush waiter, or resolves at once when every publish has
    /// already been confirmed.
    pub(crate) fn begin_flush(&self) -> Result<Option<oneshot::Receiver<Result<()>>>> {
        let mut state = self.state.lock();
        let mode = state.mode;
        match mode {
            OutboundMode::Closed => return Err(Error::ConnectionClosed),
            _ if state.out_seq == state.acked_seq => return Ok(None),
            OutboundMode::Connected => state.queue_ping(),
            // Re-pinged once the reconnect buffer has been replayed.
            OutboundMode::Reconnecting => {}
        }
        let (tx, rx) = oneshot::channel();
        let seq = state.out_seq;
        state.waiters.push_back(PongWaiter { seq, tx });
        drop(state);
        self.wake.notify_one();
        self.urgent.notify_one();
        Ok(Some(rx))
    }

    /// Matches a PONG to the oldest outstanding PING.
    pub(crate) fn on_pong(&self) {
        let mut state = self.state.lock();
        let Some(seq) = state.pings.pop_front() else {
            return;
        };
        state.acked_seq = state.acked_seq.max(seq);
        while state
            .waiters
            .front()
            .is_some_and(|waiter| waiter.seq <= state.acked_seq)
        {
            if let Some(waiter) = state.waiters.pop_front() {
                let _ = waiter.tx.send(Ok(()));
            }
        }
    }

    /// Takes everything buffered for the current transport.
    pub(crate) fn take_pending(&self) -> Bytes {
        self.state.lock().pending.split().freeze()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub(crate) fn reconnect_buffered(&self) -> usize {
        self.state.lock().reconnect.len()
    }

    pub(crate) async fn wait_for_data(&self) {
        self.wake.notified().await
    }

    pub(crate) async fn wait_urgent(&self) {
        self.urgent.notified().await
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    /// Transport lost: redirect publishes into the reconnect buffer. Bytes not
    /// yet written and unanswered PINGs went down with the old socket.
    pub(crate) fn begin_reconnect(&self) -> usize {
        let mut state = self.state.lock();
        if state.mode == OutboundMode::Closed {
            return 0;
        }
        state.mode = OutboundMode::Reconnecting;
        let lost = state.pending.len();
        state.pending.clear();
        state.pings.clear();
        lost
    }

    /// New transport ready. `replay` builds the subscription replay and runs
    /// under the outbound lock, so no SUB issued meanwhile can be missed.
    /// Returns the number of buffered publishes replayed.
    pub(crate) fn resume(&self, replay: impl FnOnce(&mut BytesMut)) -> usize {
        let mut state = self.state.lock();
        if state.mode == OutboundMode::Closed {
            return 0;
        }
        state.pending.clear();
        replay(&mut state.pending);
        if !state.pending.is_empty() {
            // Replayed SUBs must be covered by the next flush too.
            state.out_seq += 1;
        }
        let replayed = state.reconnect.frames();
        let buffered = state.reconnect.take();
        state.pending.extend_from_slice(&buffered);
        if !state.waiters.is_empty() {
            state.queue_ping();
        }
        state.mode = OutboundMode::Connected;
        drop(state);
        self.wake.notify_one();
        self.urgent.notify_one();
        replayed
    }

    /// Terminal. Unwritten bytes stay for a final best-effort write; the
    /// reconnect buffer is discarded and flush waiters fail.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.mode = OutboundMode::Closed;
        state.reconnect.clear();
        state.pings.clear();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(Error::ConnectionClosed));
        }
        drop(state);
        self.wake.notify_one();
        self.urgent.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(ceiling: usize) -> Outbound {
        let outbound = Outbound::new(ceiling, 1024);
        outbound.resume(|_| {});
        outbound
    }

    #[test]
    fn reconnect_buffer_never_exceeds_ceiling() {
        let mut buffer = ReconnectBuffer::new(10);
        buffer.try_append(b"12345").expect("fits");
        buffer.try_append(b"67890").expect("fits exactly");
        assert!(matches!(
            buffer.try_append(b"x"),
            Err(Error::ReconnectBufferExceeded)
        ));
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.frames(), 2);

        let mut disabled = ReconnectBuffer::new(0);
        assert!(disabled.try_append(b"x").is_err());
        assert!(disabled.is_empty());
    }

    #[test]
    fn control_frames_are_dropped_while_reconnecting() {
        let outbound = Outbound::new(64, 1024);
        outbound
            .enqueue(FrameKind::Control, b"SUB a 1\r\n")
            .expect("control");
        outbound
            .enqueue(FrameKind::Publish, b"PUB a 1\r\nx\r\n")
            .expect("buffered");
        assert_eq!(outbound.pending_len(), 0);
        assert_eq!(outbound.reconnect_buffered(), 12);

        let replayed = outbound.resume(|buf| buf.extend_from_slice(b"SUB a 1\r\n"));
        assert_eq!(replayed, 1);
        assert_eq!(&outbound.take_pending()[..], b"SUB a 1\r\nPUB a 1\r\nx\r\n");
        assert_eq!(outbound.reconnect_buffered(), 0);
    }

    #[test]
    fn flush_with_nothing_pending_resolves_immediately() {
        let outbound = connected(0);
        assert!(outbound.begin_flush().expect("flush").is_none());
    }

    #[tokio::test]
    async fn flush_covers_subscription_frames() {
        let outbound = connected(0);
        outbound
            .enqueue(FrameKind::Control, b"SUB a 1\r\n")
            .expect("control");
        let rx = outbound.begin_flush().expect("flush").expect("waiter");
        assert_eq!(&outbound.take_pending()[..], b"SUB a 1\r\nPING\r\n");
        outbound.on_pong();
        assert!(rx.await.expect("resolved").is_ok());

        outbound
            .enqueue(FrameKind::Control, b"UNSUB 1\r\n")
            .expect("control");
        assert!(outbound.begin_flush().expect("flush").is_some());
    }

    #[test]
    fn replayed_subscriptions_need_a_new_flush() {
        let outbound = connected(0);
        assert!(outbound.begin_flush().expect("flush").is_none());
        outbound.begin_reconnect();
        outbound.resume(|buf| buf.extend_from_slice(b"SUB a 1\r\n"));
        assert!(outbound.begin_flush().expect("flush").is_some());
    }

    #[tokio::test]
    async fn flush_waits_for_the_covering_pong() {
        let outbound = connected(0);
        // Keepalive ping queued before the publish must not satisfy the flush.
        assert!(outbound.ping());
        outbound
            .enqueue(FrameKind::Publish, b"PUB a 1\r\nx\r\n")
            .expect("publish");
        let mut rx = outbound.begin_flush().expect("flush").expect("waiter");
        assert_eq!(&outbound.take_pending()[..], b"PING\r\nPUB a 1\r\nx\r\nPING\r\n");

        outbound.on_pong();
        assert!(rx.try_recv().is_err());
        outbound.on_pong();
        assert!(rx.await.expect("resolved").is_ok());
        assert!(outbound.begin_flush().expect("flush").is_none());
    }

    #[tokio::test]
    async fn flush_waiters_survive_reconnect_and_fail_on_close() {
        let outbound = connected(1024);
        outbound
            .enqueue(FrameKind::Publish, b"PUB a 1\r\nx\r\n")
            .expect("publish");
        let carried = outbound.begin_flush().expect("flush").expect("waiter");
        outbound.begin_reconnect();
        outbound
            .enqueue(FrameKind::Publish, b"PUB b 1\r\ny\r\n")
            .expect("buffered");
        outbound.resume(|_| {});
        assert_eq!(&outbound.take_pending()[..], b"PUB b 1\r\ny\r\nPING\r\n");
        outbound.on_pong();
        assert!(carried.await.expect("resolved").is_ok());

        outbound
            .enqueue(FrameKind::Publish, b"PUB c 1\r\nz\r\n")
            .expect("publish");
        let doomed = outbound.begin_flush().expect("flush").expect("waiter");
        outbound.close();
        assert!(matches!(doomed.await.expect("resolved"), Err(Error::ConnectionClosed)));
        assert!(matches!(
            outbound.enqueue(FrameKind::Publish, b"x"),
            Err(Error::ConnectionClosed)
        ));
    }
}
