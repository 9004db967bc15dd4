// Client options, defaults, and env / YAML override layering.
use anyhow::{Context, Result};
use courier_transport::TlsOptions;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Signer;
use crate::client::event_router::{ClientEvent, Listeners};
use crate::error::Error;
use crate::nuid::{IdGenerator, Nuid};
use crate::server_pool::ReconnectDelay;

pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_MAX_RECONNECT: u32 = 60;
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(100);
pub const DEFAULT_RECONNECT_BUF_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_PENDING_MSGS_LIMIT: usize = 65_536;
pub const DEFAULT_PENDING_BYTES_LIMIT: usize = 64 * 1024 * 1024;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_PINGS_OUTSTANDING: u32 = 2;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX";
/// Enqueuing past this many buffered bytes wakes the flusher immediately.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 32 * 1024;

#[derive(Clone)]
pub struct Options {
    pub servers: Vec<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub signer: Option<Arc<dyn Signer>>,
    pub tls: Option<TlsOptions>,
    pub tls_required: bool,
    pub allow_reconnect: bool,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay: ReconnectDelay,
    /// Bytes of publishes held while reconnecting. Zero disables buffering.
    pub reconnect_buffer_size: usize,
    /// Per-subscription defaults; zero means unlimited.
    pub pending_msgs_limit: usize,
    pub pending_bytes_limit: usize,
    pub ping_interval: Duration,
    pub max_pings_outstanding: u32,
    pub connect_timeout: Duration,
    pub flush_timeout: Duration,
    pub request_timeout: Duration,
    pub no_echo: bool,
    pub no_randomize: bool,
    pub verbose: bool,
    pub pedantic: bool,
    pub inbox_prefix: String,
    /// One inbox subscription per request instead of the shared wildcard inbox.
    pub old_request_style: bool,
    pub flush_threshold: usize,
    /// Extra batching delay for the flusher; zero writes as soon as woken.
    pub flush_interval: Duration,
    pub retry_on_failed_connect: bool,
    pub id_generator: Arc<dyn IdGenerator>,
    pub(crate) listeners: Listeners,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_URL.to_string()],
            name: None,
            user: None,
            password: None,
            token: None,
            signer: None,
            tls: None,
            tls_required: false,
            allow_reconnect: true,
            max_reconnect_attempts: Some(DEFAULT_MAX_RECONNECT),
            reconnect_delay: ReconnectDelay::default(),
            reconnect_buffer_size: DEFAULT_RECONNECT_BUF_SIZE,
            pending_msgs_limit: DEFAULT_PENDING_MSGS_LIMIT,
            pending_bytes_limit: DEFAULT_PENDING_BYTES_LIMIT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_outstanding: DEFAULT_MAX_PINGS_OUTSTANDING,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            no_echo: false,
            no_randomize: false,
            verbose: false,
            pedantic: false,
            inbox_prefix: DEFAULT_INBOX_PREFIX.to_string(),
            old_request_style: false,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_interval: Duration::ZERO,
            retry_on_failed_connect: false,
            id_generator: Arc::new(Nuid::new()),
            listeners: Listeners::default(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("servers", &self.servers)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("has_password", &self.password.is_some())
            .field("has_token", &self.token.is_some())
            .field("has_signer", &self.signer.is_some())
            .field("tls", &self.tls)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("reconnect_buffer_size", &self.reconnect_buffer_size)
            .field("ping_interval", &self.ping_interval)
            .field("no_echo", &self.no_echo)
            .field("no_randomize", &self.no_randomize)
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn user_and_password(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn signer(mut self, signer: impl Signer + 'static) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_delay(mut self, delay: ReconnectDelay) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn reconnect_buffer_size(mut self, bytes: usize) -> Self {
        self.reconnect_buffer_size = bytes;
        self
    }

    pub fn pending_limits(mut self, msgs: usize, bytes: usize) -> Self {
        self.pending_msgs_limit = msgs;
        self.pending_bytes_limit = bytes;
        self
    }

    pub fn ping_interval(mut self, interval: Duration, max_outstanding: u32) -> Self {
        self.ping_interval = interval;
        self.max_pings_outstanding = max_outstanding;
        self
    }

    pub fn no_echo(mut self) -> Self {
        self.no_echo = true;
        self
    }

    pub fn no_randomize(mut self) -> Self {
        self.no_randomize = true;
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.id_generator = Arc::new(ids);
        self
    }

    /// Receives every lifecycle and async event, in order.
    pub fn on_event(mut self, listener: impl Fn(&ClientEvent) + Send + Sync + 'static) -> Self {
        self.listeners.on_event.push(Arc::new(listener));
        self
    }

    pub fn on_disconnected(mut self, listener: impl Fn() + Send + Sync + 'static) -> Self {
        self.listeners.on_disconnected = Some(Arc::new(listener));
        self
    }

    pub fn on_reconnected(mut self, listener: impl Fn() + Send + Sync + 'static) -> Self {
        self.listeners.on_reconnected = Some(Arc::new(listener));
        self
    }

    pub fn on_closed(mut self, listener: impl Fn() + Send + Sync + 'static) -> Self {
        self.listeners.on_closed = Some(Arc::new(listener));
        self
    }

    /// Slow consumers and non-fatal server errors.
    pub fn on_async_error(mut self, listener: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.listeners.on_async_error = Some(Arc::new(listener));
        self
    }

    /// Defaults, then `COURIER_*` environment variables, then the YAML file at
    /// `config_path` or `COURIER_CLIENT_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut options = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: OptionsOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut options);
        }
        Ok(options)
    }

    fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = read_string_env("COURIER_SERVERS") {
            options.servers = split_servers(&value);
        }
        if let Some(value) = read_string_env("COURIER_NAME") {
            options.name = Some(value);
        }
        if let Some(value) = read_string_env("COURIER_USER") {
            options.user = Some(value);
        }
        if let Some(value) = read_string_env("COURIER_PASSWORD") {
            options.password = Some(value);
        }
        if let Some(value) = read_string_env("COURIER_TOKEN") {
            options.token = Some(value);
        }
        if let Some(value) = read_i64_env("COURIER_MAX_RECONNECT") {
            options.max_reconnect_attempts = attempts_from(value);
        }
        if let Some(value) = read_u64_env("COURIER_RECONNECT_WAIT_MS") {
            options.reconnect_delay = ReconnectDelay::Fixed {
                wait: Duration::from_millis(value),
                jitter: DEFAULT_RECONNECT_JITTER,
            };
        }
        if let Some(value) = read_usize_env("COURIER_RECONNECT_BUF_SIZE") {
            options.reconnect_buffer_size = value;
        }
        if let Some(value) = read_usize_env("COURIER_PENDING_MSGS_LIMIT") {
            options.pending_msgs_limit = value;
        }
        if let Some(value) = read_usize_env("COURIER_PENDING_BYTES_LIMIT") {
            options.pending_bytes_limit = value;
        }
        if let Some(value) = read_u64_env("COURIER_PING_INTERVAL_MS") {
            options.ping_interval = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("COURIER_MAX_PINGS_OUT") {
            options.max_pings_outstanding = value.min(u32::MAX as u64) as u32;
        }
        if let Some(value) = read_u64_env("COURIER_CONNECT_TIMEOUT_MS") {
            options.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_bool_env("COURIER_NO_RANDOMIZE") {
            options.no_randomize = value;
        }
        if let Some(value) = read_bool_env("COURIER_NO_ECHO") {
            options.no_echo = value;
        }
        if let Some(value) = read_string_env("COURIER_INBOX_PREFIX") {
            options.inbox_prefix = value;
        }
        options
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct OptionsOverride {
    servers: Option<Vec<String>>,
    name: Option<String>,
    user: Option<String>,
    password: Option<String>,
    token: Option<String>,
    allow_reconnect: Option<bool>,
    max_reconnect_attempts: Option<i64>,
    reconnect_wait_ms: Option<u64>,
    reconnect_jitter_ms: Option<u64>,
    reconnect_max_wait_ms: Option<u64>,
    reconnect_buffer_size: Option<usize>,
    pending_msgs_limit: Option<usize>,
    pending_bytes_limit: Option<usize>,
    ping_interval_ms: Option<u64>,
    max_pings_outstanding: Option<u32>,
    connect_timeout_ms: Option<u64>,
    flush_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    no_echo: Option<bool>,
    no_randomize: Option<bool>,
    verbose: Option<bool>,
    pedantic: Option<bool>,
    inbox_prefix: Option<String>,
    old_request_style: Option<bool>,
    flush_threshold: Option<usize>,
    flush_interval_ms: Option<u64>,
    retry_on_failed_connect: Option<bool>,
    tls_required: Option<bool>,
    tls_ca_file: Option<String>,
    tls_cert_file: Option<String>,
    tls_key_file: Option<String>,
}

impl OptionsOverride {
    fn apply(&self, options: &mut Options) {
        if let Some(value) = &self.servers
            && !value.is_empty()
        {
            options.servers = value.clone();
        }
        if let Some(value) = &self.name {
            options.name = Some(value.clone());
        }
        if let Some(value) = &self.user {
            options.user = Some(value.clone());
        }
        if let Some(value) = &self.password {
            options.password = Some(value.clone());
        }
        if let Some(value) = &self.token {
            options.token = Some(value.clone());
        }
        if let Some(value) = self.allow_reconnect {
            options.allow_reconnect = value;
        }
        if let Some(value) = self.max_reconnect_attempts {
            options.max_reconnect_attempts = attempts_from(value);
        }
        if let Some(wait) = self.reconnect_wait_ms {
            let jitter = self
                .reconnect_jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RECONNECT_JITTER);
            options.reconnect_delay = match self.reconnect_max_wait_ms {
                Some(max) if max > wait => ReconnectDelay::Exponential {
                    base: Duration::from_millis(wait),
                    max: Duration::from_millis(max),
                    jitter,
                },
                _ => ReconnectDelay::Fixed {
                    wait: Duration::from_millis(wait),
                    jitter,
                },
            };
        }
        if let Some(value) = self.reconnect_buffer_size {
            options.reconnect_buffer_size = value;
        }
        if let Some(value) = self.pending_msgs_limit {
            options.pending_msgs_limit = value;
        }
        if let Some(value) = self.pending_bytes_limit {
            options.pending_bytes_limit = value;
        }
        if let Some(value) = self.ping_interval_ms
            && value > 0
        {
            options.ping_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.max_pings_outstanding
            && value > 0
        {
            options.max_pings_outstanding = value;
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            options.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.flush_timeout_ms
            && value > 0
        {
            options.flush_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.request_timeout_ms
            && value > 0
        {
            options.request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.no_echo {
            options.no_echo = value;
        }
        if let Some(value) = self.no_randomize {
            options.no_randomize = value;
        }
        if let Some(value) = self.verbose {
            options.verbose = value;
        }
        if let Some(value) = self.pedantic {
            options.pedantic = value;
        }
        if let Some(value) = &self.inbox_prefix
            && !value.is_empty()
        {
            options.inbox_prefix = value.clone();
        }
        if let Some(value) = self.old_request_style {
            options.old_request_style = value;
        }
        if let Some(value) = self.flush_threshold
            && value > 0
        {
            options.flush_threshold = value;
        }
        if let Some(value) = self.flush_interval_ms {
            options.flush_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_on_failed_connect {
            options.retry_on_failed_connect = value;
        }
        if let Some(value) = self.tls_required {
            options.tls_required = value;
        }
        if self.tls_ca_file.is_some() || self.tls_cert_file.is_some() {
            let tls = options.tls.get_or_insert_with(TlsOptions::default);
            if let Some(path) = &self.tls_ca_file {
                tls.ca_file = Some(path.into());
            }
            if let Some(path) = &self.tls_cert_file {
                tls.client_cert = Some(path.into());
            }
            if let Some(path) = &self.tls_key_file {
                tls.client_key = Some(path.into());
            }
        }
    }
}

// Negative means retry forever.
fn attempts_from(value: i64) -> Option<u32> {
    u32::try_from(value).ok()
}

fn split_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn read_i64_env(key: &str) -> Option<i64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct EnvGuard(&'static [&'static str]);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in self.0 {
                unsafe { std::env::remove_var(key) };
            }
        }
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_defaults() {
        let _guard = EnvGuard(&[
            "COURIER_SERVERS",
            "COURIER_MAX_RECONNECT",
            "COURIER_NO_ECHO",
            "COURIER_RECONNECT_BUF_SIZE",
        ]);
        unsafe {
            std::env::set_var("COURIER_SERVERS", "nats://a:4222, nats://b:4223");
            std::env::set_var("COURIER_MAX_RECONNECT", "-1");
            std::env::set_var("COURIER_NO_ECHO", "true");
            std::env::set_var("COURIER_RECONNECT_BUF_SIZE", "0");
        }
        let options = Options::from_env_or_yaml(None).expect("options");
        assert_eq!(options.servers, ["nats://a:4222", "nats://b:4223"]);
        assert_eq!(options.max_reconnect_attempts, None);
        assert!(options.no_echo);
        assert_eq!(options.reconnect_buffer_size, 0);
    }

    #[test]
    #[serial_test::serial]
    fn yaml_file_wins_over_env() {
        let _guard = EnvGuard(&["COURIER_NAME"]);
        unsafe { std::env::set_var("COURIER_NAME", "from-env") };
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "name: from-yaml\nmax_reconnect_attempts: 5\nreconnect_wait_ms: 100\nreconnect_max_wait_ms: 800\nold_request_style: true"
        )
        .expect("write");
        let path = file.path().to_str().expect("utf8 path");
        let options = Options::from_env_or_yaml(Some(path)).expect("options");
        assert_eq!(options.name.as_deref(), Some("from-yaml"));
        assert_eq!(options.max_reconnect_attempts, Some(5));
        assert!(options.old_request_style);
        assert!(matches!(
            options.reconnect_delay,
            ReconnectDelay::Exponential { base, max, .. }
                if base == Duration::from_millis(100) && max == Duration::from_millis(800)
        ));
    }

    #[test]
    #[serial_test::serial]
    fn unreadable_or_invalid_yaml_is_an_error() {
        assert!(Options::from_env_or_yaml(Some("/definitely/not/here.yaml")).is_err());
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "no_such_option: 1").expect("write");
        let path = file.path().to_str().expect("utf8 path");
        assert!(Options::from_env_or_yaml(Some(path)).is_err());
    }

    #[test]
    fn debug_output_omits_secrets() {
        let options = Options::default().user_and_password("alice", "hunter2").token("t0k");
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("t0k"));
    }
}
