use anyhow::{Result, Context};
use rand::{thread_rng, Rng};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, Duration};
use tracing::{debug, warn};
use reqwest::Client;

use crate::cli::config::ProxySettings;

/// Raised when every proxy in the pool is banned. Callers must treat this as
/// fatal for scheduling rather than waiting for a cool-down to expire.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Proxy pool exhausted: all {pool_size} entries are banned")]
pub struct PoolExhausted {
    pub pool_size: usize,
}

/// Lifecycle state of a single proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Active,
    Banned,
}

/// A single egress address in the rotation pool
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    /// host:port address string
    pub address: String,
    pub state: ProxyState,
    /// When the entry was banned, if it is banned
    pub banned_at: Option<Instant>,
    /// When the entry last served a request
    pub last_used_at: Option<Instant>,
}

impl ProxyEntry {
    fn new(address: String) -> Self {
        Self {
            address,
            state: ProxyState::Active,
            banned_at: None,
            last_used_at: None,
        }
    }
}

/// Proxy rotation and ban management. Shared by every concurrent fetch, so
/// all state transitions happen under one lock.
pub struct ProxyRotator {
    /// Cool-down before a banned entry re-enters rotation
    cooldown: Duration,

    /// The pool; entry state is only ever mutated while the lock is held
    entries: Mutex<Vec<ProxyEntry>>,
}

impl ProxyRotator {
    /// Create a rotator over the given host:port addresses
    pub fn new(addresses: Vec<String>, cooldown: Duration) -> Self {
        let entries = addresses.into_iter().map(ProxyEntry::new).collect();

        Self {
            cooldown,
            entries: Mutex::new(entries),
        }
    }

    /// Create a rotator from the proxy settings
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self::new(
            settings.proxy_list.clone(),
            Duration::from_secs(settings.cooldown_secs),
        )
    }

    /// Select a proxy for the next request: random pick among ACTIVE entries.
    /// Cooled-down entries are reactivated before selection so a sweep task
    /// is not required for forward progress.
    pub async fn next(&self) -> Result<ProxyEntry, PoolExhausted> {
        let mut entries = self.entries.lock().await;
        Self::reactivate(&mut entries, self.cooldown);

        let active: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == ProxyState::Active)
            .map(|(i, _)| i)
            .collect();

        if active.is_empty() {
            return Err(PoolExhausted {
                pool_size: entries.len(),
            });
        }

        let index = active[thread_rng().gen_range(0..active.len())];
        entries[index].last_used_at = Some(Instant::now());

        Ok(entries[index].clone())
    }

    /// Mark a proxy as banned and start its cool-down. Reporting an already
    /// banned entry is a no-op so two workers cannot double-ban it.
    pub async fn report_banned(&self, entry: &ProxyEntry) {
        let mut entries = self.entries.lock().await;

        if let Some(e) = entries.iter_mut().find(|e| e.address == entry.address) {
            if e.state == ProxyState::Active {
                debug!("Marking proxy as banned: {}", e.address);
                e.state = ProxyState::Banned;
                e.banned_at = Some(Instant::now());
            }
        }
    }

    /// Move cooled-down BANNED entries back to ACTIVE
    pub async fn reactivate_expired(&self) {
        let mut entries = self.entries.lock().await;
        Self::reactivate(&mut entries, self.cooldown);
    }

    fn reactivate(entries: &mut [ProxyEntry], cooldown: Duration) {
        for entry in entries.iter_mut() {
            if entry.state == ProxyState::Banned {
                let expired = entry
                    .banned_at
                    .map_or(true, |banned_at| banned_at.elapsed() >= cooldown);

                if expired {
                    debug!("Reactivating cooled-down proxy: {}", entry.address);
                    entry.state = ProxyState::Active;
                    entry.banned_at = None;
                }
            }
        }
    }

    /// Number of entries currently in rotation
    pub async fn active_count(&self) -> usize {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|e| e.state == ProxyState::Active)
            .count()
    }

    /// Total pool size
    pub async fn pool_size(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Health of a single proxy after a probe request
#[derive(Debug, Clone)]
pub struct ProxyHealth {
    pub address: String,
    pub working: bool,
}

/// Probe every configured proxy with a plain HTTP request and report which
/// ones answer. Used by the `proxies` CLI command, not by the crawl itself.
pub async fn check_pool(settings: &ProxySettings, probe_url: &str) -> Result<Vec<ProxyHealth>> {
    let mut report = Vec::with_capacity(settings.proxy_list.len());

    for address in &settings.proxy_list {
        let working = probe_proxy(address, probe_url).await;

        if working {
            debug!("Proxy tested OK: {}", address);
        } else {
            warn!("Proxy test failed: {}", address);
        }

        report.push(ProxyHealth {
            address: address.clone(),
            working,
        });
    }

    Ok(report)
}

/// Probe a single proxy address
async fn probe_proxy(address: &str, probe_url: &str) -> bool {
    let proxy_url = format!("http://{}", address);

    let proxy = match reqwest::Proxy::all(&proxy_url) {
        Ok(proxy) => proxy,
        Err(e) => {
            warn!("Invalid proxy address {}: {}", address, e);
            return false;
        }
    };

    let client = match Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .proxy(proxy)
        .build()
        .context("Failed to create proxy client")
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to create proxy client for {}: {:#}", address, e);
            return false;
        }
    };

    match client.get(probe_url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rotator(addresses: &[&str], cooldown_secs: u64) -> ProxyRotator {
        ProxyRotator::new(
            addresses.iter().map(|a| a.to_string()).collect(),
            Duration::from_secs(cooldown_secs),
        )
    }

    #[tokio::test]
    async fn next_returns_configured_entry() {
        let rotator = make_rotator(&["10.0.0.1:8080"], 300);

        let entry = rotator.next().await.unwrap();
        assert_eq!(entry.address, "10.0.0.1:8080");
        assert_eq!(entry.state, ProxyState::Active);
        assert!(entry.last_used_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn banned_entry_sits_out_until_cooldown_expires() {
        let rotator = make_rotator(&["10.0.0.1:8080", "10.0.0.2:8080"], 300);

        let banned = rotator.next().await.unwrap();
        rotator.report_banned(&banned).await;

        // Only the other entry is eligible while the ban holds
        for _ in 0..20 {
            let entry = rotator.next().await.unwrap();
            assert_ne!(entry.address, banned.address);
        }
        assert_eq!(rotator.active_count().await, 1);

        // After the cool-down the banned entry is eligible again
        tokio::time::advance(Duration::from_secs(301)).await;
        rotator.reactivate_expired().await;
        assert_eq!(rotator.active_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn next_reactivates_lazily_without_a_sweep() {
        let rotator = make_rotator(&["10.0.0.1:8080"], 60);

        let entry = rotator.next().await.unwrap();
        rotator.report_banned(&entry).await;
        assert!(rotator.next().await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;

        // next() itself must recover the pool
        let entry = rotator.next().await.unwrap();
        assert_eq!(entry.address, "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn exhausted_pool_errors_instead_of_blocking() {
        let rotator = make_rotator(&["10.0.0.1:8080", "10.0.0.2:8080"], 300);

        for _ in 0..2 {
            let entry = rotator.next().await.unwrap();
            rotator.report_banned(&entry).await;
        }

        let err = rotator.next().await.unwrap_err();
        assert_eq!(err, PoolExhausted { pool_size: 2 });
    }

    #[tokio::test]
    async fn double_ban_is_a_noop() {
        let rotator = make_rotator(&["10.0.0.1:8080", "10.0.0.2:8080"], 300);

        let entry = rotator.next().await.unwrap();
        rotator.report_banned(&entry).await;
        rotator.report_banned(&entry).await;

        assert_eq!(rotator.active_count().await, 1);
    }
}
