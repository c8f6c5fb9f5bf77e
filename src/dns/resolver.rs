use log::{debug, trace};
use moka::future::Cache;
use std::net::IpAddr;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::DnsConfig;

/// Reverse DNS for metric labels.
///
/// Resolved names live for `cache_ttl`. A failed lookup falls back to the
/// textual address and is remembered separately for `failure_ttl`, after
/// which the address is looked up again.
pub struct HostnameResolver {
    resolver: TokioAsyncResolver,
    names: Cache<IpAddr, String>,
    failures: Cache<IpAddr, ()>,
}

impl HostnameResolver {
    pub fn new(config: &DnsConfig) -> Self {
        let capacity = config.cache_size as u64;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default()),
            names: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(config.cache_ttl)
                .build(),
            failures: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(config.failure_ttl)
                .build(),
        }
    }

    pub async fn resolve(&self, ip: IpAddr) -> String {
        if let Some(name) = self.names.get(&ip).await {
            return name;
        }
        if self.failures.get(&ip).await.is_some() {
            trace!("Reverse lookup of {} failed recently, using the address", ip);
            return ip.to_string();
        }

        let name = match self.resolver.reverse_lookup(ip).await {
            Ok(response) => response
                .iter()
                .last()
                .map(|name| name.to_string().trim_end_matches('.').to_string())
                .filter(|name| !name.is_empty()),
            Err(e) => {
                debug!("Reverse lookup of {} failed: {}", ip, e);
                None
            }
        };

        match name {
            Some(name) => {
                self.names.insert(ip, name.clone()).await;
                name
            }
            None => {
                self.failures.insert(ip, ()).await;
                ip.to_string()
            }
        }
    }

    /// Approximate number of resolved names currently cached.
    pub fn cached(&self) -> u64 {
        self.names.entry_count()
    }

    #[cfg(test)]
    pub(crate) async fn remember(&self, ip: IpAddr, name: &str) {
        self.names.insert(ip, name.to_string()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    fn config(cache_size: usize) -> DnsConfig {
        DnsConfig {
            resolve: true,
            cache_size,
            ..DnsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cached_name_is_returned_without_lookup() {
        let resolver = HostnameResolver::new(&config(16));
        resolver.remember(ip(1), "one.example").await;
        assert_eq!(resolver.resolve(ip(1)).await, "one.example");
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let resolver = HostnameResolver::new(&config(2));
        for last in 1..=20 {
            resolver.remember(ip(last), "host.example").await;
        }
        resolver.names.run_pending_tasks().await;
        assert!(resolver.cached() <= 2);
    }

    #[tokio::test]
    async fn test_failure_expires_and_is_retried() {
        let resolver = HostnameResolver::new(&DnsConfig {
            failure_ttl: Duration::from_millis(50),
            ..config(16)
        });
        resolver.failures.insert(ip(7), ()).await;
        assert_eq!(resolver.resolve(ip(7)).await, "192.0.2.7");

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(resolver.failures.get(&ip(7)).await.is_none());

        // a name learned after the failure expired wins over the fallback
        resolver.remember(ip(7), "seven.example").await;
        assert_eq!(resolver.resolve(ip(7)).await, "seven.example");
    }

    #[tokio::test]
    async fn test_names_expire_after_ttl() {
        let resolver = HostnameResolver::new(&DnsConfig {
            cache_ttl: Duration::from_millis(50),
            ..config(16)
        });
        resolver.remember(ip(3), "three.example").await;
        assert!(resolver.names.get(&ip(3)).await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(resolver.names.get(&ip(3)).await.is_none());
    }
}
