mod common;

use common::{WAIT, connect};
use courier_client::Error;
use courier_test_harness::MockServer;
use std::time::{Duration, Instant};

#[tokio::test]
async fn flush_with_nothing_pending_returns_immediately() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    server.set_answer_pings(false);
    let pings_before = server.pings_received();

    let started = Instant::now();
    client
        .flush(Duration::from_millis(500))
        .await
        .expect("nothing to flush");
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(server.pings_received(), pings_before);
}

#[tokio::test]
async fn flush_covers_everything_published_before_it() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    for i in 0..500u32 {
        client.publish("bulk", i.to_string()).expect("publish");
    }
    client.flush(WAIT).await.expect("flush");
    // The server answered the PING only after processing every PUB queued before it.
    assert_eq!(server.published().len(), 500);

    // Confirmed: a second flush has nothing to wait for.
    client.flush(Duration::from_millis(1)).await.expect("no-op");
}

#[tokio::test]
async fn flush_times_out_when_server_never_answers() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    server.set_answer_pings(false);
    client.publish("foo", "bar").expect("publish");

    let started = Instant::now();
    let result = client.flush(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(Error::Timeout(_))), "{result:?}");
    assert!(started.elapsed() >= Duration::from_millis(100));
    // A local timeout leaves the connection alone.
    assert_eq!(client.state(), courier_client::ConnectionState::Connected);

    server.set_answer_pings(true);
    client.flush(WAIT).await.expect("flush once answered");
}

#[tokio::test]
async fn flush_after_close_reports_closed() {
    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    client.close().await;
    assert!(matches!(
        client.flush(WAIT).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn flush_waits_for_pending_subscriptions() {
    let silent = MockServer::start().await.expect("server");
    let client = connect(&silent).await;
    silent.set_answer_pings(false);
    let _quiet = client.subscribe("quiet").expect("subscribe");
    let result = client.flush(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(Error::Timeout(_))), "{result:?}");

    let server = MockServer::start().await.expect("server");
    let client = connect(&server).await;
    for i in 0..50u32 {
        let _sub = client.subscribe(&format!("sync.{i}")).expect("subscribe");
        client.flush(WAIT).await.expect("flush");
        // The PONG arrived after the server processed the SUB.
        assert_eq!(server.subscription_count(), 1);
    }
    client.flush(WAIT).await.expect("flush");
    assert_eq!(server.subscription_count(), 0);
}
