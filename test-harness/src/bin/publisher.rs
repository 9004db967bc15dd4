// Load tool: publishes messages to a broker at a configured rate.
use anyhow::{Context, Result};
use clap::Parser;
use courier_client::{Client, ClientEvent, Error};
use courier_test_harness::tls;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Load publisher for the courier client")]
struct Args {
    /// Comma separated server URLs. Falls back to COURIER_SERVERS / YAML config.
    #[arg(long)]
    servers: Option<String>,

    /// Optional YAML config file layered over the environment
    #[arg(long)]
    config: Option<String>,

    /// Subject to publish on
    #[arg(long, default_value = "load.test")]
    subject: String,

    /// Message payload size in bytes
    #[arg(long, default_value = "1024")]
    payload_size: usize,

    /// Messages per second rate (0 = unlimited)
    #[arg(long, default_value = "100")]
    rate: u64,

    /// Total number of messages to publish (0 = unlimited)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Publisher ID for logging
    #[arg(long, default_value = "pub-1")]
    id: String,

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
    if options.name.is_none() {
        options.name = Some(args.id.clone());
    }
    let id = args.id.clone();
    let options = options.on_event(move |event| match event {
        ClientEvent::Disconnected => warn!(id = %id, "disconnected"),
        ClientEvent::Reconnected => info!(id = %id, "reconnected"),
        other => info!(id = %id, event = ?other, "client event"),
    });

    info!(
        id = %args.id,
        servers = ?options.servers,
        subject = %args.subject,
        payload_size = args.payload_size,
        rate = args.rate,
        count = args.count,
        "Starting publisher"
    );
    let client = Client::connect(options)
        .await
        .context("connect to broker")?;
    info!(id = %args.id, server = ?client.connected_url(), "Connected");

    let payload = vec![b'x'; args.payload_size];
    let delay = (args.rate > 0).then(|| Duration::from_micros(1_000_000 / args.rate));

    let start_time = Instant::now();
    let mut published = 0u64;
    let mut errors = 0u64;

    loop {
        if args.count > 0 && published >= args.count {
            break;
        }

        match client.publish(&args.subject, &payload) {
            Ok(()) => {
                published += 1;
                if published % 1000 == 0 {
                    let rate = published as f64 / start_time.elapsed().as_secs_f64();
                    info!(
                        id = %args.id,
                        published,
                        errors,
                        buffered = client.buffered(),
                        rate = format!("{rate:.2}"),
                        "Publishing progress"
                    );
                }
            }
            Err(Error::ConnectionClosed) => {
                error!(id = %args.id, "connection closed, stopping");
                break;
            }
            Err(e) => {
                errors += 1;
                if errors % 100 == 1 {
                    error!(id = %args.id, error = %e, errors, "Publish error");
                }
            }
        }

        if let Some(delay) = delay {
            sleep(delay).await;
        }
    }

    if let Err(err) = client.flush(Duration::from_secs(10)).await {
        warn!(id = %args.id, error = %err, "final flush failed");
    }
    let stats = client.statistics();
    let elapsed = start_time.elapsed();
    info!(
        id = %args.id,
        published,
        errors,
        out_bytes = stats.out_bytes,
        reconnects = stats.reconnects,
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", published as f64 / elapsed.as_secs_f64()),
        "Publisher completed"
    );
    client.close().await;
    Ok(())
}
