//! Name resolution: forward target resolution and cached PTR lookups.

pub mod cache;

use anyhow::{anyhow, Context, Result};
use cache::TwoQueueCache;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use once_cell::sync::OnceCell;
use std::net::IpAddr;

/// Capacity of the process-wide reverse-DNS cache.
pub const RDNS_CACHE_CAPACITY: usize = 8192;

static RESOLVER: OnceCell<TokioResolver> = OnceCell::new();
static RDNS: OnceCell<RdnsService> = OnceCell::new();

fn resolver() -> &'static TokioResolver {
    RESOLVER.get_or_init(|| {
        TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build()
    })
}

/// Resolve a probe target. IP literals pass through untouched; anything
/// else goes through a forward lookup and takes the first record.
pub async fn resolve_target(target: &str) -> Result<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }
    let lookup = resolver()
        .lookup_ip(target)
        .await
        .with_context(|| format!("failed to resolve target '{target}'"))?;
    lookup
        .iter()
        .next()
        .ok_or_else(|| anyhow!("no address records for target '{target}'"))
}

/// PTR lookups behind a bounded admission-controlled cache, so a long MTR
/// run over ever-new hop addresses cannot evict the entries probes reuse
/// every period.
pub struct RdnsService {
    cache: TwoQueueCache<String, String>,
}

impl RdnsService {
    /// The process-wide service with the default capacity.
    pub fn global() -> &'static RdnsService {
        RDNS.get_or_init(RdnsService::new)
    }

    pub fn new() -> Self {
        Self::with_capacity(RDNS_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RdnsService {
            cache: TwoQueueCache::new(capacity),
        }
    }

    /// Pre-load a record, e.g. from a warmed cache.
    pub fn prime(&self, ip: impl Into<String>, record: impl Into<String>) {
        self.cache.insert(ip.into(), record.into());
    }

    /// The PTR record for `ip`, or `""` when the address has none or the
    /// lookup fails. Successful lookups are cached, including empty ones;
    /// failures are not, so a transient resolver outage heals itself.
    pub async fn lookup(&self, ip: &str) -> String {
        if let Some(record) = self.cache.get(ip) {
            return record;
        }
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return String::new();
        };
        match resolver().reverse_lookup(addr).await {
            Ok(lookup) => {
                let record = lookup
                    .iter()
                    .next()
                    .map(|name| {
                        let name = name.to_string();
                        name.strip_suffix('.').unwrap_or(&name).to_string()
                    })
                    .unwrap_or_default();
                self.cache.insert(ip.to_string(), record.clone());
                record
            }
            Err(_) => String::new(),
        }
    }
}

impl Default for RdnsService {
    fn default() -> Self {
        Self::new()
    }
}
