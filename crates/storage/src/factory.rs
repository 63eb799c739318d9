use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use clinicdesk_core::Tenant;

use crate::{StorageError, TenantDatabase};

/// Scope id used for the fallback database opened without a tenant.
pub const FALLBACK_SCOPE: &str = "fallback";

/// Opens data contexts bound to a single tenant's isolated database.
///
/// Pools are cached per tenant id. A tenant's connection descriptor is stable
/// for its lifetime, so a cached pool is never re-pointed.
#[derive(Clone)]
pub struct TenantDataContextFactory {
    pools: Arc<RwLock<HashMap<String, TenantDatabase>>>,
    fallback_url: Option<String>,
}

impl TenantDataContextFactory {
    pub fn new(fallback_url: Option<String>) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            fallback_url,
        }
    }

    /// Returns a data context connected to `tenant`'s descriptor.
    pub async fn open(&self, tenant: &Tenant) -> Result<TenantDatabase, FactoryError> {
        if tenant.connection.trim().is_empty() {
            return Err(FactoryError::MissingConnection(tenant.id.clone()));
        }
        self.open_scoped(&tenant.id, &tenant.connection).await
    }

    /// Opens the tenant's context, or the fallback database when no tenant was
    /// resolved. Without a fallback the call fails with `TenantNotFound`.
    pub async fn open_for(&self, tenant: Option<&Tenant>) -> Result<TenantDatabase, FactoryError> {
        match (tenant, self.fallback_url.as_deref()) {
            (Some(tenant), _) => self.open(tenant).await,
            (None, Some(url)) => self.open_scoped(FALLBACK_SCOPE, url).await,
            (None, None) => Err(FactoryError::TenantNotFound),
        }
    }

    /// Opens and migrates the fallback database, if one is configured.
    pub async fn prepare_fallback(&self) -> Result<Option<TenantDatabase>, FactoryError> {
        if self.fallback_url.is_none() {
            return Ok(None);
        }
        let db = self.open_for(None).await?;
        db.run_migrations().await?;
        Ok(Some(db))
    }

    /// Drops the cached pool of a tenant, closing its connections.
    pub async fn evict(&self, tenant_id: &str) {
        let removed = self.pools.write().await.remove(tenant_id);
        if let Some(db) = removed {
            db.close().await;
            debug!(stage = "factory", tenant_id, "evicted tenant pool");
        }
    }

    /// Number of tenant pools currently cached.
    pub async fn cached_pools(&self) -> usize {
        self.pools.read().await.len()
    }

    async fn open_scoped(&self, scope: &str, url: &str) -> Result<TenantDatabase, FactoryError> {
        if let Some(db) = self.pools.read().await.get(scope) {
            return Ok(db.clone());
        }

        let db = TenantDatabase::connect(scope, url).await?;
        let mut guard = self.pools.write().await;
        let entry = guard.entry(scope.to_string()).or_insert(db).clone();
        debug!(stage = "factory", tenant_id = scope, "opened tenant pool");
        Ok(entry)
    }
}

/// Errors raised while opening a tenant data context.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("no tenant resolved and no fallback database configured")]
    TenantNotFound,
    #[error("tenant {0} has no connection descriptor")]
    MissingConnection(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support::sqlite_url, NewPatient};
    use chrono::Utc;
    use clinicdesk_core::ProvisioningState;
    use tempfile::TempDir;

    fn tenant(dir: &TempDir, id: &str) -> Tenant {
        Tenant {
            id: id.to_string(),
            name: id.to_string(),
            domain: format!("{id}.local"),
            connection: sqlite_url(dir, &format!("{id}.db")),
            enabled: true,
            locales: vec!["en".into()],
            created_at: Utc::now(),
            provisioning_state: ProvisioningState::NotificationSent,
            provisioning_error: None,
        }
    }

    async fn open_migrated(factory: &TenantDataContextFactory, tenant: &Tenant) -> TenantDatabase {
        let db = factory.open(tenant).await.expect("open");
        db.run_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn tenants_never_observe_each_other() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = TenantDataContextFactory::new(None);
        let sunrise = tenant(&dir, "sunrise");
        let moon = tenant(&dir, "moon");

        let sunrise_db = open_migrated(&factory, &sunrise).await;
        let moon_db = open_migrated(&factory, &moon).await;
        assert_eq!(sunrise_db.tenant_id(), "sunrise");
        assert_eq!(moon_db.tenant_id(), "moon");

        for (db, marker) in [(&sunrise_db, "sunrise-marker"), (&moon_db, "moon-marker")] {
            db.patients()
                .insert(&NewPatient {
                    full_name: marker,
                    phone: None,
                    created_at: Utc::now(),
                })
                .await
                .expect("insert marker");
        }

        let sunrise_names: Vec<String> = sunrise_db
            .patients()
            .list(10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.full_name)
            .collect();
        let moon_names: Vec<String> = moon_db
            .patients()
            .list(10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.full_name)
            .collect();
        assert_eq!(sunrise_names, vec!["sunrise-marker"]);
        assert_eq!(moon_names, vec!["moon-marker"]);
    }

    #[tokio::test]
    async fn pools_are_cached_and_evictable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = TenantDataContextFactory::new(None);
        let sunrise = tenant(&dir, "sunrise");

        factory.open(&sunrise).await.unwrap();
        factory.open(&sunrise).await.unwrap();
        assert_eq!(factory.cached_pools().await, 1);

        factory.evict("sunrise").await;
        assert_eq!(factory.cached_pools().await, 0);
    }

    #[tokio::test]
    async fn missing_tenant_without_fallback_is_an_error() {
        let factory = TenantDataContextFactory::new(None);
        let err = factory.open_for(None).await.unwrap_err();
        assert!(matches!(err, FactoryError::TenantNotFound));
    }

    #[tokio::test]
    async fn missing_tenant_uses_configured_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = TenantDataContextFactory::new(Some(sqlite_url(&dir, "fallback.db")));
        let db = factory.open_for(None).await.expect("fallback opens");
        assert_eq!(db.tenant_id(), FALLBACK_SCOPE);

        let sunrise = tenant(&dir, "sunrise");
        let db = factory.open_for(Some(&sunrise)).await.unwrap();
        assert_eq!(db.tenant_id(), "sunrise");
    }

    #[tokio::test]
    async fn fallback_is_migrated_when_prepared() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(TenantDataContextFactory::new(None)
            .prepare_fallback()
            .await
            .expect("no fallback")
            .is_none());

        let factory = TenantDataContextFactory::new(Some(sqlite_url(&dir, "fallback.db")));
        let db = factory
            .prepare_fallback()
            .await
            .expect("prepare")
            .expect("fallback configured");
        db.patients()
            .insert(&NewPatient {
                full_name: "Walk-in",
                phone: None,
                created_at: Utc::now(),
            })
            .await
            .expect("fallback schema is ready");
        assert_eq!(db.patients().list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_descriptor_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut broken = tenant(&dir, "broken");
        broken.connection = " ".into();
        let factory = TenantDataContextFactory::new(None);
        assert!(matches!(
            factory.open(&broken).await,
            Err(FactoryError::MissingConnection(id)) if id == "broken"
        ));
    }
}
