mod common;

use bytes::Bytes;
use common::{WAIT, connect, options_for, with_events, wait_for_event};
use courier_client::{Client, ClientEvent, Error, HeaderMap, Options, SubscriptionMode};
use courier_test_harness::{MockServer, MockServerConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[tokio::test]
async fn subscribe_publish_flush_next_message() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;

    let mut sub = client.subscribe("foo").expect("subscribe");
    client.publish("foo", "bar").expect("publish");
    client.flush(Duration::from_millis(1000)).await.expect("flush");

    let msg = sub
        .next_message(Duration::from_millis(1000))
        .await
        .expect("message");
    assert_eq!(msg.subject, "foo");
    assert_eq!(msg.payload, Bytes::from_static(b"bar"));
    assert_eq!(msg.reply, None);

    let stats = client.statistics();
    assert_eq!(stats.out_msgs, 1);
    assert_eq!(stats.in_msgs, 1);
    assert_eq!(stats.in_bytes, 3);
    client.close().await;
}

#[tokio::test]
async fn headers_round_trip_through_hmsg() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let mut sub = client.subscribe("orders.created").expect("subscribe");

    let mut headers = HeaderMap::new();
    headers.append("Trace-Id", "abc123");
    headers.append("Tag", "first");
    headers.append("Tag", "second");
    client
        .publish_with_headers("orders.created", &headers, b"\x00\x01payload")
        .expect("publish");
    client.flush(WAIT).await.expect("flush");

    let msg = sub.next_message(WAIT).await.expect("message");
    assert_eq!(msg.headers.as_ref(), Some(&headers));
    assert_eq!(
        msg.headers
            .as_ref()
            .map(|h| h.get_all("Tag").collect::<Vec<_>>()),
        Some(vec!["first", "second"])
    );
    assert_eq!(msg.payload, Bytes::from_static(b"\x00\x01payload"));

    let published = server.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].headers.as_ref(), Some(&headers));
}

#[tokio::test]
async fn unsubscribe_twice_is_a_noop() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let mut sub = client.subscribe("foo").expect("subscribe");
    let mut other = client.subscribe("other").expect("subscribe");
    assert!(server.wait_for_subscriptions(2, WAIT).await);

    sub.unsubscribe().expect("first unsubscribe");
    sub.unsubscribe().expect("second unsubscribe");
    assert!(!sub.is_valid());
    client.flush(WAIT).await.expect("flush");
    assert_eq!(server.subscription_count(), 1);

    // A late MSG for the old sid is dropped and the connection carries on.
    let late = format!("MSG foo {} 4\r\nlate\r\n", sub.sid());
    server.send_raw(late.as_bytes());
    server.publish("other", "still-alive");
    let msg = other.next_message(WAIT).await.expect("other");
    assert_eq!(msg.payload, Bytes::from_static(b"still-alive"));
    assert!(matches!(
        sub.next_message(Duration::from_millis(50)).await,
        Err(Error::SubscriptionClosed)
    ));
    assert_eq!(client.state(), courier_client::ConnectionState::Connected);
}

#[tokio::test]
async fn slow_subscription_does_not_starve_fast_one() {
    let server = MockServer::start().await.expect("server");
    let (options, mut events) = with_events(options_for(&server).pending_limits(2, 0));
    let async_errors = Arc::new(AtomicU64::new(0));
    let error_count = async_errors.clone();
    let options = options.on_async_error(move |err| {
        if matches!(err, Error::SlowConsumer { .. }) {
            error_count.fetch_add(1, Ordering::SeqCst);
        }
    });
    let client = Client::connect(options).await.expect("connect");

    let slow = client
        .subscribe_with_handler("slow", None, |_msg| std::future::pending::<()>())
        .expect("slow");
    let mut fast = client.subscribe("fast").expect("fast");
    // Only the stalled handler runs with the tight connection-wide limits.
    fast.set_pending_limits(0, 0);
    assert_eq!(slow.pending_limits(), (2, 0));

    for i in 0..20u32 {
        client.publish("slow", i.to_string()).expect("publish slow");
        client.publish("fast", i.to_string()).expect("publish fast");
    }
    client.flush(WAIT).await.expect("flush");

    let started = Instant::now();
    for i in 0..20u32 {
        let msg = fast.next_message(WAIT).await.expect("fast message");
        assert_eq!(msg.payload, Bytes::from(i.to_string()));
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    let event = wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::SlowConsumer { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::SlowConsumer {
            sid: slow.sid(),
            subject: "slow".to_string()
        }
    );
    // One handler call in progress plus at most two queued.
    assert_eq!(slow.delivered(), 20);
    assert!(slow.dropped() >= 17, "dropped {}", slow.dropped());
    assert_eq!(fast.dropped(), 0);
    assert_eq!(client.statistics().dropped, slow.dropped());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(async_errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handler_subscription_sees_messages_in_order() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = client
        .subscribe_with_handler("ticks", None, move |msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.payload);
            }
        })
        .expect("subscribe");
    assert_eq!(sub.mode(), SubscriptionMode::Async);

    for i in 0..100u32 {
        client.publish("ticks", i.to_string()).expect("publish");
    }
    client.flush(WAIT).await.expect("flush");
    for i in 0..100u32 {
        let payload = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("in time")
            .expect("payload");
        assert_eq!(payload, Bytes::from(i.to_string()));
    }
}

#[tokio::test]
async fn next_message_is_rejected_on_handler_subscriptions() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let mut sub = client
        .subscribe_with_handler("x", None, |_msg| async {})
        .expect("subscribe");
    assert!(matches!(
        sub.next_message(Duration::from_millis(10)).await,
        Err(Error::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn next_message_times_out() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let mut sub = client.subscribe("quiet").expect("subscribe");
    let started = Instant::now();
    assert!(matches!(
        sub.next_message(Duration::from_millis(100)).await,
        Err(Error::Timeout(_))
    ));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn auto_unsubscribe_stops_after_max() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let mut sub = client.subscribe("jobs").expect("subscribe");
    sub.auto_unsubscribe(3).expect("auto unsubscribe");
    for i in 0..5u32 {
        client.publish("jobs", i.to_string()).expect("publish");
    }
    client.flush(WAIT).await.expect("flush");

    for i in 0..3u32 {
        let msg = sub.next_message(WAIT).await.expect("message");
        assert_eq!(msg.payload, Bytes::from(i.to_string()));
    }
    assert!(matches!(
        sub.next_message(Duration::from_millis(100)).await,
        Err(Error::SubscriptionClosed)
    ));
    assert_eq!(server.subscription_count(), 0);
}

#[tokio::test]
async fn queue_group_members_share_messages() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    let mut first = client.queue_subscribe("work", "workers").expect("first");
    let mut second = client.queue_subscribe("work", "workers").expect("second");
    assert_eq!(first.queue(), Some("workers"));

    for i in 0..20u32 {
        client.publish("work", i.to_string()).expect("publish");
    }
    client.flush(WAIT).await.expect("flush");

    let mut received = 0;
    for sub in [&mut first, &mut second] {
        while sub.next_message(Duration::from_millis(50)).await.is_ok() {
            received += 1;
        }
    }
    assert_eq!(received, 20);
    assert_eq!(first.delivered() + second.delivered(), 20);
}

#[tokio::test]
async fn no_echo_suppresses_own_messages() {
    let server = MockServer::start().await.expect("server");
    let quiet = Client::connect(options_for(&server).no_echo())
        .await
        .expect("connect");
    let listener = connect(&server).await;

    let mut own = quiet.subscribe("chat").expect("subscribe");
    let mut remote = listener.subscribe("chat").expect("subscribe");
    assert!(server.wait_for_subscriptions(2, WAIT).await);

    quiet.publish("chat", "hello").expect("publish");
    quiet.flush(WAIT).await.expect("flush");

    let msg = remote.next_message(WAIT).await.expect("remote copy");
    assert_eq!(msg.payload, Bytes::from_static(b"hello"));
    assert!(matches!(
        own.next_message(Duration::from_millis(100)).await,
        Err(Error::Timeout(_))
    ));
    assert!(server.connects().iter().any(|connect| !connect.echo));
}

#[tokio::test]
async fn oversized_and_invalid_publishes_fail_locally() {
    let server = MockServer::with_config(MockServerConfig {
        max_payload: 16,
        ..MockServerConfig::default()
    })
    .await
    .expect("server");
    let client = connect(&server).await;
    assert_eq!(client.max_payload(), 16);

    assert!(matches!(
        client.publish("foo", [0u8; 17]),
        Err(Error::MaxPayloadExceeded { size: 17, max: 16 })
    ));
    assert!(matches!(
        client.publish("foo bar", "x"),
        Err(Error::InvalidSubject(_))
    ));
    assert!(matches!(client.subscribe(""), Err(Error::InvalidSubject(_))));
    client.publish("foo", [0u8; 16]).expect("fits");
    client.flush(WAIT).await.expect("flush");
    assert_eq!(server.published().len(), 1);
    assert_eq!(client.state(), courier_client::ConnectionState::Connected);
}

#[tokio::test]
async fn dropping_the_handle_unsubscribes() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    {
        let _sub = client.subscribe("temp").expect("subscribe");
        assert!(server.wait_for_subscriptions(1, WAIT).await);
    }
    client.flush(WAIT).await.expect("flush");
    assert_eq!(server.subscription_count(), 0);
}

#[tokio::test]
async fn connect_info_carries_name_and_capabilities() {
    let server = MockServer::start().await.expect("server");
    let options: Options = options_for(&server).name("inventory");
    let client = Client::connect(options).await.expect("connect");
    client.flush(WAIT).await.expect("flush");
    let connects = server.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].name.as_deref(), Some("inventory"));
    assert!(connects[0].headers);
    assert!(connects[0].no_responders);
    assert_eq!(connects[0].lang, "rust");
    assert!(client.server_info().is_some());
    assert_eq!(client.connected_url(), Some(server.url()));
}
