use super::*;
use bytes::Bytes;
use courier_wire::ServerOp;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

use crate::client::client::ClientInner;
use crate::client::connection::{SessionEnd, process};
use crate::client::outbound::OutboundMode;

fn inner_with(options: Options) -> Arc<ClientInner> {
    let pool = ServerPool::new(&options.servers, false).expect("pool");
    Arc::new(ClientInner::new(options, pool))
}

fn msg_op(sid: u64, subject: &str, payload: &'static [u8]) -> ServerOp {
    ServerOp::Message {
        subject: subject.to_string(),
        sid,
        reply: None,
        headers: None,
        payload: Bytes::from_static(payload),
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event in time")
        .expect("event")
}

#[tokio::test]
async fn publishes_buffer_until_first_connect_and_respect_ceiling() {
    // Before a transport is activated the outbound side is in reconnect mode.
    let inner = inner_with(Options::default().reconnect_buffer_size(32));
    assert_eq!(inner.outbound.mode(), OutboundMode::Reconnecting);
    inner
        .publish_raw("foo", None, None, b"0123456789")
        .expect("buffered");
    assert!(matches!(
        inner.publish_raw("foo", None, None, b"0123456789"),
        Err(Error::ReconnectBufferExceeded)
    ));
    assert!(inner.outbound.reconnect_buffered() <= 32);
    // A failed publish is not counted.
    assert_eq!(inner.stats.snapshot().out_msgs, 1);
}

#[tokio::test]
async fn publish_validates_subjects_and_max_payload() {
    let inner = inner_with(Options::default());
    assert!(matches!(
        inner.publish_raw("bad subject", None, None, b"x"),
        Err(Error::InvalidSubject(_))
    ));
    assert!(matches!(
        inner.publish_raw("foo", Some("bad..reply"), None, b"x"),
        Err(Error::InvalidSubject(_))
    ));

    inner.apply_info(
        ServerInfo {
            max_payload: 8,
            ..ServerInfo::default()
        },
        false,
    );
    assert!(matches!(
        inner.publish_raw("foo", None, None, b"123456789"),
        Err(Error::MaxPayloadExceeded { size: 9, max: 8 })
    ));
}

#[tokio::test]
async fn read_loop_routes_messages_and_flags_slow_consumers_once() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let options = Options::default()
        .pending_limits(1, 0)
        .on_event(move |event| {
            let _ = events_tx.send(event.clone());
        });
    let inner = inner_with(options);
    let pings_out = AtomicU32::new(0);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let entry = Arc::new(client::subscription::SubEntry::new(
        inner.registry.next_sid(),
        "orders".to_string(),
        None,
        tx,
        (1, 0),
    ));
    inner.registry.insert(entry.clone());

    assert!(process(&inner, msg_op(entry.sid, "orders", b"1"), &pings_out).is_none());
    assert!(process(&inner, msg_op(entry.sid, "orders", b"2"), &pings_out).is_none());
    assert!(process(&inner, msg_op(entry.sid, "orders", b"3"), &pings_out).is_none());
    // Unknown sids are ignored.
    assert!(process(&inner, msg_op(999, "orders", b"4"), &pings_out).is_none());

    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::SlowConsumer {
            sid: entry.sid,
            subject: "orders".to_string()
        }
    );
    assert_eq!(rx.try_recv().expect("first").payload, Bytes::from_static(b"1"));
    assert!(rx.try_recv().is_err());

    let stats = inner.stats.snapshot();
    assert_eq!(stats.in_msgs, 4);
    assert_eq!(stats.dropped, 2);
}

#[tokio::test]
async fn server_errors_are_classified() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let inner = inner_with(Options::default().on_event(move |event| {
        let _ = events_tx.send(event.clone());
    }));
    let pings_out = AtomicU32::new(0);

    let permissions = ServerOp::Err("Permissions Violation for Publish to secret".to_string());
    assert!(process(&inner, permissions, &pings_out).is_none());
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::ServerError(message) if message.contains("Permissions")
    ));

    let stale = ServerOp::Err("Stale Connection".to_string());
    assert!(matches!(
        process(&inner, stale, &pings_out),
        Some(SessionEnd::Lost(Error::ConnectionLost(_)))
    ));

    let auth = ServerOp::Err("Authorization Violation".to_string());
    assert!(matches!(
        process(&inner, auth, &pings_out),
        Some(SessionEnd::Fatal(Error::Authorization(_)))
    ));

    let other = ServerOp::Err("Maximum Connections Exceeded".to_string());
    assert!(matches!(
        process(&inner, other, &pings_out),
        Some(SessionEnd::Fatal(Error::Server(_)))
    ));
}

#[tokio::test]
async fn pong_resets_outstanding_pings() {
    let inner = inner_with(Options::default());
    let pings_out = AtomicU32::new(2);
    assert!(process(&inner, ServerOp::Pong, &pings_out).is_none());
    assert_eq!(pings_out.load(std::sync::atomic::Ordering::Acquire), 0);
}

#[tokio::test]
async fn async_info_announces_discovery_and_lame_duck() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let inner = inner_with(
        Options::with_servers(["nats://127.0.0.1:4222"]).on_event(move |event| {
            let _ = events_tx.send(event.clone());
        }),
    );
    let pings_out = AtomicU32::new(0);
    let info = ServerInfo {
        connect_urls: vec!["127.0.0.1:4222".to_string(), "10.0.0.2:4222".to_string()],
        lame_duck_mode: true,
        ..ServerInfo::default()
    };
    assert!(process(&inner, ServerOp::Info(Box::new(info)), &pings_out).is_none());

    match next_event(&mut events).await {
        ClientEvent::ServersDiscovered(added) => {
            assert_eq!(added.len(), 1);
            assert!(added[0].contains("10.0.0.2"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(next_event(&mut events).await, ClientEvent::LameDuckMode);
    assert_eq!(inner.pool.lock().len(), 2);
}

#[tokio::test]
async fn finish_close_fails_everything_once() {
    let closed = Arc::new(AtomicU32::new(0));
    let closed_count = closed.clone();
    let inner = inner_with(Options::default().on_closed(move || {
        closed_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }));
    let mut pending = inner.requests.register("_INBOX.test");
    let (tx, mut rx) = mpsc::unbounded_channel();
    inner.registry.insert(Arc::new(client::subscription::SubEntry::new(
        inner.registry.next_sid(),
        "foo".to_string(),
        None,
        tx,
        (0, 0),
    )));

    inner.finish_close();
    inner.finish_close();

    assert!(matches!(
        pending.wait(Duration::from_secs(1)).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(rx.recv().await.is_none());
    assert!(matches!(
        inner.publish_raw("foo", None, None, b"x"),
        Err(Error::ConnectionClosed)
    ));
    assert_eq!(inner.state(), ConnectionState::Closed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn inbox_uses_prefix_and_injected_ids() {
    struct Counter(std::sync::atomic::AtomicU64);
    impl IdGenerator for Counter {
        fn next_id(&self) -> String {
            self.0
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                .to_string()
        }
    }
    let mut options = Options::default().id_generator(Counter(std::sync::atomic::AtomicU64::new(7)));
    options.inbox_prefix = "_REPLY".to_string();
    let inner = inner_with(options);
    assert_eq!(inner.new_inbox(), "_REPLY.7");
    assert_eq!(inner.new_inbox(), "_REPLY.8");
}
