//! Name resolution
//!
//! Internal VIPs only expose a private DNS name; when the Service asks for
//! an IP, the name is resolved here. Answers are cached for a short TTL.

use crate::domain::ports::{NameResolver, NameResolverRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Resolver backed by the system resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::NameResolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// TTL cache in front of another resolver. Failures are not cached.
pub struct CachingResolver {
    inner: NameResolverRef,
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Vec<IpAddr>)>>,
}

impl CachingResolver {
    pub fn new(inner: NameResolverRef, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached hosts, expired ones included until the next insert
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl NameResolver for CachingResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let cached = self
            .entries
            .lock()
            .get(host)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, ips)| ips.clone());
        if let Some(ips) = cached {
            debug!(host, "Name resolution cache hit");
            return Ok(ips);
        }

        let ips = self.inner.resolve(host).await?;
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        entries.retain(|_, (at, _)| at.elapsed() < ttl);
        entries.insert(host.to_string(), (Instant::now(), ips.clone()));
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NameResolver for CountingResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if host == "missing.internal" {
                return Err(Error::NameResolution {
                    host: host.into(),
                    reason: "NXDOMAIN".into(),
                });
            }
            Ok(vec!["10.0.0.7".parse().unwrap()])
        }
    }

    #[tokio::test]
    async fn test_cache_hits_within_ttl() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let resolver = CachingResolver::new(inner.clone(), Duration::from_secs(30));

        let first = resolver.resolve("vip.internal").await.unwrap();
        let second = resolver.resolve("vip.internal").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        resolver.clear();
        resolver.resolve("vip.internal").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_and_failures_are_not_cached() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let resolver = CachingResolver::new(inner.clone(), Duration::ZERO);
        resolver.resolve("vip.internal").await.unwrap();
        resolver.resolve("vip.internal").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        assert!(resolver.resolve("missing.internal").await.is_err());
        assert!(resolver.resolve("missing.internal").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_expired_hosts_are_evicted() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let resolver = CachingResolver::new(inner.clone(), Duration::from_millis(20));
        resolver.resolve("a.internal").await.unwrap();
        resolver.resolve("b.internal").await.unwrap();
        assert_eq!(resolver.len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        resolver.resolve("c.internal").await.unwrap();
        assert_eq!(resolver.len(), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_system_resolver_handles_literals() {
        let ips = SystemResolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
