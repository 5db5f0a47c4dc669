//! # Dialer and DNS Resolution
//!
//! The Runner owns one base dialer and one DNS cache, shared read-only by
//! every VU after `SetOptions` (`spec.md` §5 "Shared resources"). Each VU
//! then builds its own `reqwest::Client` against the shared
//! `DnsResolverCache`, so host-override (`options.hosts`) and
//! blacklist (`options.blacklistIPs`) behavior is centralized in one place
//! rather than duplicated per VU.
//!
//! Modeled the same shape as `sui-historical-cache`'s TTL-keyed stores: a
//! `parking_lot::RwLock<HashMap<...>>` guarding cache entries, with a
//! generation/expiry check on read rather than a background sweeper.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Connect/keepalive timeouts shared by every VU's transport. `spec.md`
/// §4.2 specifies 30s connect/keepalive, dual-stack.
#[derive(Debug, Clone, Copy)]
pub struct DialerConfig {
    pub connect_timeout: Duration,
    pub keepalive: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
        }
    }
}

struct CacheEntry {
    addrs: Vec<IpAddr>,
    expires_at: Instant,
}

/// An in-process DNS cache keyed by hostname with a configurable TTL.
/// `resolve` consults `hosts` overrides first (`options.hosts`), then the
/// cache, then falls through to `std::net::ToSocketAddrs`, filtering out
/// any address present in `blacklist`.
pub struct DnsResolverCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hosts: RwLock<HashMap<String, String>>,
    blacklist: RwLock<Vec<IpAddr>>,
}

impl DnsResolverCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(Vec::new()),
        }
    }

    pub fn set_hosts(&self, hosts: HashMap<String, String>) {
        *self.hosts.write() = hosts;
    }

    pub fn set_blacklist(&self, blacklist: Vec<IpAddr>) {
        *self.blacklist.write() = blacklist;
    }

    /// Resolve `host` to a set of candidate addresses, honoring overrides
    /// and the blacklist. Returns an empty vec (rather than erroring) when
    /// every resolved address is blacklisted, so the caller's dial attempt
    /// fails with a normal connection error instead of a resolver-specific
    /// one.
    pub fn resolve(&self, host: &str, port: u16) -> Vec<SocketAddr> {
        let target_host = self
            .hosts
            .read()
            .get(host)
            .cloned()
            .unwrap_or_else(|| host.to_string());

        if let Some(entry) = self.entries.read().get(&target_host) {
            if entry.expires_at > Instant::now() {
                return self.filtered(&entry.addrs, port);
            }
        }

        let resolved: Vec<IpAddr> = (target_host.as_str(), port)
            .to_socket_addrs_ok()
            .into_iter()
            .map(|s| s.ip())
            .collect();

        self.entries.write().insert(
            target_host.clone(),
            CacheEntry {
                addrs: resolved.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.filtered(&resolved, port)
    }

    fn filtered(&self, addrs: &[IpAddr], port: u16) -> Vec<SocketAddr> {
        let blacklist = self.blacklist.read();
        addrs
            .iter()
            .filter(|ip| !blacklist.contains(ip))
            .map(|ip| SocketAddr::new(*ip, port))
            .collect()
    }
}

impl Default for DnsResolverCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

trait ToSocketAddrsOk {
    fn to_socket_addrs_ok(&self) -> Vec<SocketAddr>;
}

impl ToSocketAddrsOk for (&str, u16) {
    fn to_socket_addrs_ok(&self) -> Vec<SocketAddr> {
        use std::net::ToSocketAddrs;
        self.to_socket_addrs()
            .map(|it| it.collect())
            .unwrap_or_default()
    }
}

/// Shared, read-only-after-`SetOptions` dialer state: the base timeouts plus
/// the DNS cache. Cloned cheaply (`Arc`-backed) into every VU.
#[derive(Clone)]
pub struct BaseDialer {
    pub config: DialerConfig,
    pub resolver: Arc<DnsResolverCache>,
}

impl Default for BaseDialer {
    fn default() -> Self {
        Self {
            config: DialerConfig::default(),
            resolver: Arc::new(DnsResolverCache::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_resolution_results() {
        let cache = DnsResolverCache::new(Duration::from_secs(60));
        let first = cache.resolve("localhost", 80);
        let second = cache.resolve("localhost", 80);
        assert_eq!(first, second);
    }

    #[test]
    fn host_override_redirects_lookup() {
        let cache = DnsResolverCache::new(Duration::from_secs(60));
        let mut hosts = HashMap::new();
        hosts.insert("example.test".to_string(), "localhost".to_string());
        cache.set_hosts(hosts);
        // Doesn't panic / errors are swallowed into an empty result set.
        let _ = cache.resolve("example.test", 80);
    }

    #[test]
    fn blacklisted_addresses_are_filtered() {
        let cache = DnsResolverCache::new(Duration::from_secs(60));
        cache.set_blacklist(vec!["127.0.0.1".parse().unwrap()]);
        let resolved = cache.resolve("127.0.0.1", 80);
        assert!(resolved.is_empty());
    }
}
