use std::{sync::Arc, time::Duration};

use metrics::counter;
use moka::future::Cache;
use tracing::error;

use clinicdesk_core::{normalize_host, Tenant};
use clinicdesk_storage::{DirectoryError, TenantRepository};

const CACHE_CAPACITY: u64 = 10_000;

/// Maps request hosts to live tenants.
///
/// Lookups go to the directory; an optional TTL cache keyed by normalised
/// host sits in front and is flushed whenever the directory changes.
#[derive(Clone)]
pub struct TenantResolver {
    tenants: TenantRepository,
    cache: Option<Cache<String, Option<Arc<Tenant>>>>,
}

impl TenantResolver {
    /// A zero `ttl` disables caching.
    pub fn new(tenants: TenantRepository, ttl: Duration) -> Self {
        let cache = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(ttl)
                .build()
        });
        Self { tenants, cache }
    }

    pub async fn resolve(&self, host: &str) -> Result<Option<Arc<Tenant>>, DirectoryError> {
        let Some(key) = normalize_host(host) else {
            counter!("tenant_resolution_total", "result" => "unresolved").increment(1);
            return Ok(None);
        };

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key).await {
                counter!("tenant_resolution_total", "result" => "cached").increment(1);
                return Ok(hit);
            }
        }

        let tenant = match self.tenants.find_by_domain(&key).await {
            Ok(tenant) => tenant.map(Arc::new),
            Err(err) => {
                counter!("tenant_resolution_total", "result" => "error").increment(1);
                error!(stage = "tenancy", host = %key, error = %err, "tenant lookup failed");
                return Err(err);
            }
        };

        if let Some(cache) = &self.cache {
            cache.insert(key, tenant.clone()).await;
        }
        let result = if tenant.is_some() { "resolved" } else { "unresolved" };
        counter!("tenant_resolution_total", "result" => result).increment(1);
        Ok(tenant)
    }

    /// Oldest live tenant, used by single-tenant deployments.
    pub async fn find_first(&self) -> Result<Option<Arc<Tenant>>, DirectoryError> {
        Ok(self.tenants.find_first().await?.map(Arc::new))
    }

    pub fn invalidate_all(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}
