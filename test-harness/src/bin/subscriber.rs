// Load tool: subscribes to a subject and reports receive rates.
use anyhow::{Context, Result};
use clap::Parser;
use courier_client::{Client, ClientEvent, Error};
use courier_test_harness::tls;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "subscriber")]
#[command(about = "Load subscriber for the courier client")]
struct Args {
    /// Comma separated server URLs. Falls back to COURIER_SERVERS / YAML config.
    #[arg(long)]
    servers: Option<String>,

    /// Optional YAML config file layered over the environment
    #[arg(long)]
    config: Option<String>,

    /// Subject (wildcards allowed)
    #[arg(long, default_value = "load.>")]
    subject: String,

    /// Queue group to join
    #[arg(long)]
    queue: Option<String>,

    /// Subscriber ID for logging
    #[arg(long, default_value = "sub-1")]
    id: String,

    /// Stop after this many idle seconds (0 = never)
    #[arg(long, default_value = "60")]
    timeout: u64,

    /// Disable certificate validation (for self-signed certs)
    #[arg(long, default_value = "false")]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut options = courier_client::Options::from_env_or_yaml(args.config.as_deref())?;
    if let Some(servers) = &args.servers {
        options.servers = servers.split(',').map(|s| s.trim().to_string()).collect();
    }
    if args.insecure {
        options.tls = Some(courier_client::TlsOptions::with_config(
            tls::insecure_client_config()?,
        ));
    }
    let id = args.id.clone();
    let options = options.on_event(move |event| match event {
        ClientEvent::SlowConsumer { subject, .. } => {
            warn!(id = %id, subject = %subject, "slow consumer, messages dropped")
        }
        other => info!(id = %id, event = ?other, "client event"),
    });

    info!(id = %args.id, subject = %args.subject, queue = ?args.queue, "Starting subscriber");
    let client = Client::connect(options)
        .await
        .context("connect to broker")?;
    let mut subscription = match &args.queue {
        Some(queue) => client.queue_subscribe(&args.subject, queue),
        None => client.subscribe(&args.subject),
    }
    .context("subscribe")?;
    info!(id = %args.id, sid = subscription.sid(), "Subscribed");

    let idle = if args.timeout > 0 {
        Duration::from_secs(args.timeout)
    } else {
        Duration::MAX
    };
    let start_time = Instant::now();
    let mut received = 0u64;

    loop {
        match subscription.next_message(idle).await {
            Ok(msg) => {
                received += 1;
                if received % 1000 == 0 {
                    let rate = received as f64 / start_time.elapsed().as_secs_f64();
                    info!(
                        id = %args.id,
                        received,
                        dropped = subscription.dropped(),
                        rate = format!("{rate:.2}"),
                        payload_size = msg.payload.len(),
                        "Receiving progress"
                    );
                }
            }
            Err(Error::Timeout(_)) => {
                warn!(id = %args.id, "idle timeout, stopping");
                break;
            }
            Err(Error::SubscriptionClosed) => {
                info!(id = %args.id, "subscription closed");
                break;
            }
            Err(e) => {
                error!(id = %args.id, error = %e, "receive failed");
                break;
            }
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        id = %args.id,
        received,
        dropped = subscription.dropped(),
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", received as f64 / elapsed.as_secs_f64()),
        "Subscriber completed"
    );
    drop(subscription);
    client.close().await;
    Ok(())
}
