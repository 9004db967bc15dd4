// Shared setup for the integration tests.
#![allow(dead_code)]
use courier_client::{Client, ClientEvent, ConnectionState, Options, ReconnectDelay};
use courier_test_harness::MockServer;
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Options pointed at `server` with fast, jitter-free reconnects.
pub fn options_for(server: &MockServer) -> Options {
    courier_test_harness::init_tracing();
    Options::with_servers([server.url()])
        .reconnect_delay(ReconnectDelay::fixed(Duration::from_millis(20)))
        .max_reconnect_attempts(None)
}

/// Adds an event listener and returns its receiving end.
pub fn with_events(options: Options) -> (Options, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = options.on_event(move |event| {
        let _ = tx.send(event.clone());
    });
    (options, rx)
}

pub async fn connect(server: &MockServer) -> Client {
    Client::connect(options_for(server))
        .await
        .expect("connect")
}

/// Waits for the first event matching `pred`, skipping others.
pub async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

pub async fn wait_for_state(client: &Client, state: ConnectionState) {
    let mut changes = client.state_changes();
    tokio::time::timeout(WAIT, changes.wait_for(|current| *current == state))
        .await
        .expect("state in time")
        .expect("state channel open");
}
