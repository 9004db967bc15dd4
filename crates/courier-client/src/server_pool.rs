// Known brokers, candidate rotation and per-server reconnect backoff.
use courier_transport::ServerAddr;
use rand::Rng;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Wait applied before retrying a server, measured from its last attempt.
///
/// The argument to every variant is the server's consecutive failure count.
/// `Custom` replaces the built-in formulas entirely.
#[derive(Clone)]
pub enum ReconnectDelay {
    Fixed {
        wait: Duration,
        jitter: Duration,
    },
    Exponential {
        base: Duration,
        max: Duration,
        jitter: Duration,
    },
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl ReconnectDelay {
    pub fn fixed(wait: Duration) -> Self {
        ReconnectDelay::Fixed {
            wait,
            jitter: Duration::ZERO,
        }
    }

    pub fn custom(delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        ReconnectDelay::Custom(Arc::new(delay))
    }

    /// ```
    /// use courier_client::ReconnectDelay;
    /// use std::time::Duration;
    ///
    /// let delay = ReconnectDelay::Exponential {
    ///     base: Duration::from_millis(100),
    ///     max: Duration::from_secs(1),
    ///     jitter: Duration::ZERO,
    /// };
    /// assert_eq!(delay.delay(1), Duration::from_millis(100));
    /// assert_eq!(delay.delay(3), Duration::from_millis(400));
    /// assert_eq!(delay.delay(10), Duration::from_secs(1));
    /// ```
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            ReconnectDelay::Fixed { wait, jitter } => *wait + random_jitter(*jitter),
            ReconnectDelay::Exponential { base, max, jitter } => {
                let shift = failures.saturating_sub(1).min(31);
                let wait = base.saturating_mul(1u32 << shift).min(*max);
                wait + random_jitter(*jitter)
            }
            ReconnectDelay::Custom(delay) => delay(failures),
        }
    }
}

impl Default for ReconnectDelay {
    fn default() -> Self {
        ReconnectDelay::Fixed {
            wait: crate::config::DEFAULT_RECONNECT_WAIT,
            jitter: crate::config::DEFAULT_RECONNECT_JITTER,
        }
    }
}

impl fmt::Debug for ReconnectDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectDelay::Fixed { wait, jitter } => f
                .debug_struct("Fixed")
                .field("wait", wait)
                .field("jitter", jitter)
                .finish(),
            ReconnectDelay::Exponential { base, max, jitter } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            ReconnectDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn random_jitter(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    let nanos = jitter.as_nanos().min(u64::MAX as u128) as u64;
    Duration::from_nanos(rand::rng().random_range(0..=nanos))
}

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub addr: ServerAddr,
    pub reachable: bool,
    pub failures: u32,
    pub discovered: bool,
    pub last_attempt: Option<Instant>,
}

impl PoolEntry {
    fn new(addr: ServerAddr, discovered: bool) -> Self {
        Self {
            addr,
            reachable: true,
            failures: 0,
            discovered,
            last_attempt: None,
        }
    }
}

/// Seed and discovered servers. Entries are never removed, only marked
/// unreachable, and selection rotates so a failed server comes back after one
/// full pass.
#[derive(Debug)]
pub struct ServerPool {
    entries: Vec<PoolEntry>,
    cursor: usize,
    randomize: bool,
}

impl ServerPool {
    pub fn new(seeds: &[String], randomize: bool) -> Result<Self> {
        let mut entries = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let addr = ServerAddr::parse(seed)?;
            if !entries
                .iter()
                .any(|entry: &PoolEntry| entry.addr.same_endpoint(&addr))
            {
                entries.push(PoolEntry::new(addr, false));
            }
        }
        if entries.is_empty() {
            return Err(Error::NoServers);
        }
        if randomize {
            entries.shuffle(&mut rand::rng());
        }
        Ok(Self {
            entries,
            cursor: 0,
            randomize,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn servers(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.addr.to_string())
            .collect()
    }

    /// The next server in rotation.
    pub fn next_candidate(&mut self) -> Option<PoolEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = self.entries[self.cursor % self.entries.len()].clone();
        self.cursor = (self.cursor + 1) % self.entries.len();
        Some(entry)
    }

    pub fn report_attempt(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.find_mut(addr) {
            entry.last_attempt = Some(Instant::now());
        }
    }

    pub fn report_success(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.find_mut(addr) {
            entry.reachable = true;
            entry.failures = 0;
        }
    }

    pub fn report_failure(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.find_mut(addr) {
            entry.reachable = false;
            entry.failures = entry.failures.saturating_add(1);
        }
    }

    /// Adds URLs advertised by the cluster, returning the ones that were new.
    pub fn merge_discovered(&mut self, urls: &[String]) -> Vec<String> {
        let mut fresh = Vec::new();
        for url in urls {
            let addr = match ServerAddr::parse(url) {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::debug!(url = %url, error = %err, "ignoring advertised url");
                    continue;
                }
            };
            let known = self
                .entries
                .iter()
                .chain(fresh.iter())
                .any(|entry| entry.addr.same_endpoint(&addr));
            if !known {
                fresh.push(PoolEntry::new(addr, true));
            }
        }
        if self.randomize {
            fresh.shuffle(&mut rand::rng());
        }
        let added = fresh.iter().map(|entry| entry.addr.to_string()).collect();
        self.entries.extend(fresh);
        added
    }

    fn find_mut(&mut self, addr: &ServerAddr) -> Option<&mut PoolEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.addr.same_endpoint(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeds(urls: &[&str]) -> Vec<String> {
        urls.iter().map(|url| url.to_string()).collect()
    }

    #[test]
    fn ordered_pool_rotates_in_seed_order() {
        let mut pool = ServerPool::new(&seeds(&["a:1", "b:2", "c:3"]), false).expect("pool");
        let order: Vec<String> = (0..6)
            .map(|_| pool.next_candidate().expect("candidate").addr.host().to_string())
            .collect();
        assert_eq!(order, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn failed_server_is_retried_after_a_full_pass() {
        let mut pool = ServerPool::new(&seeds(&["a:1", "b:2"]), false).expect("pool");
        let first = pool.next_candidate().expect("a");
        pool.report_failure(&first.addr);
        assert_eq!(pool.next_candidate().expect("b").addr.host(), "b");
        let again = pool.next_candidate().expect("a again");
        assert_eq!(again.addr.host(), "a");
        assert_eq!(again.failures, 1);
        assert!(!again.reachable);

        pool.report_success(&again.addr);
        assert_eq!(pool.entries()[0].failures, 0);
    }

    #[test]
    fn discovered_urls_are_deduplicated() {
        let mut pool = ServerPool::new(&seeds(&["nats://127.0.0.1:4222"]), false).expect("pool");
        let added = pool.merge_discovered(&seeds(&[
            "127.0.0.1:4222",
            "10.0.0.2:4222",
            "10.0.0.2:4222",
            "not a url:xx",
        ]));
        assert_eq!(added, ["nats://10.0.0.2:4222"]);
        assert_eq!(pool.len(), 2);
        assert!(pool.entries()[1].discovered);
        assert!(pool.merge_discovered(&seeds(&["10.0.0.2"])).is_empty());
    }

    #[test]
    fn randomized_pool_keeps_every_seed() {
        let urls = seeds(&["a:1", "b:2", "c:3", "d:4", "a:1"]);
        let pool = ServerPool::new(&urls, true).expect("pool");
        let mut hosts: Vec<&str> = pool.entries().iter().map(|e| e.addr.host()).collect();
        hosts.sort();
        assert_eq!(hosts, ["a", "b", "c", "d"]);
    }

    #[test]
    fn empty_seed_list_is_rejected() {
        assert!(matches!(ServerPool::new(&[], false), Err(Error::NoServers)));
    }

    #[test]
    fn custom_delay_replaces_builtin_formula() {
        let delay = ReconnectDelay::custom(|failures| Duration::from_millis(failures as u64 * 7));
        assert_eq!(delay.delay(3), Duration::from_millis(21));

        let fixed = ReconnectDelay::Fixed {
            wait: Duration::from_millis(50),
            jitter: Duration::from_millis(10),
        };
        for failures in 0..20 {
            let wait = fixed.delay(failures);
            assert!(wait >= Duration::from_millis(50) && wait <= Duration::from_millis(60));
        }
    }
}
