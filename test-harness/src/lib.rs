// Test harness: a mock broker plus TLS helpers used by the integration tests.
pub mod mock;
pub mod tls;

pub use mock::{MockAuth, MockServer, MockServerConfig, Published, subject_matches};

/// Installs a `tracing` subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
