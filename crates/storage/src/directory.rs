use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use clinicdesk_core::{normalize_host, ProvisioningState, Tenant};

use crate::{connect_pool, is_unique_violation, to_rfc3339, StorageError};

const TENANT_COLUMNS: &str = "id, name, domain, connection, enabled, locales_json, created_at, \
                              provisioning_state, provisioning_error";

/// Handle on the shared tenant directory database.
#[derive(Clone)]
pub struct Directory {
    pool: SqlitePool,
}

impl Directory {
    /// Establishes the directory connection pool.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = connect_pool(database_url, 5).await?;
        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/directory`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations/directory")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for reading and writing tenant records.
    pub fn tenants(&self) -> TenantRepository {
        TenantRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Repository over the `tenants` and `pending_founders` tables.
#[derive(Clone)]
pub struct TenantRepository {
    pool: SqlitePool,
}

impl TenantRepository {
    /// Inserts a tenant record together with its pending founder, atomically.
    ///
    /// Fails with [`DirectoryError::DuplicateDomain`] when an enabled tenant
    /// already holds the domain.
    pub async fn insert(
        &self,
        tenant: &NewTenant<'_>,
        founder: Option<&PendingFounder>,
    ) -> Result<Tenant, DirectoryError> {
        let locales_json =
            serde_json::to_string(tenant.locales).map_err(|err| DirectoryError::Decode(err.to_string()))?;
        let created_at = to_rfc3339(tenant.created_at);
        let domain = tenant.domain.to_ascii_lowercase();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO tenants \
             (id, name, domain, connection, enabled, locales_json, created_at, provisioning_state, updated_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?)",
        )
        .bind(tenant.id)
        .bind(tenant.name)
        .bind(&domain)
        .bind(tenant.connection)
        .bind(&locales_json)
        .bind(&created_at)
        .bind(ProvisioningState::DirectoryCreated.as_str())
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_insert_error)?;

        if let Some(founder) = founder {
            sqlx::query(
                "INSERT INTO pending_founders \
                 (tenant_id, name, username, email, password_hash, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(tenant.id)
            .bind(&founder.name)
            .bind(&founder.username)
            .bind(&founder.email)
            .bind(&founder.password_hash)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(Tenant {
            id: tenant.id.to_string(),
            name: tenant.name.to_string(),
            domain,
            connection: tenant.connection.to_string(),
            enabled: true,
            locales: tenant.locales.to_vec(),
            created_at: tenant.created_at,
            provisioning_state: ProvisioningState::DirectoryCreated,
            provisioning_error: None,
        })
    }

    /// Finds the live tenant whose domain is contained in the request host.
    ///
    /// When several domains match, the longest one wins; equal lengths go to
    /// the oldest tenant.
    pub async fn find_by_domain(&self, host: &str) -> Result<Option<Tenant>, DirectoryError> {
        let Some(host) = normalize_host(host) else {
            return Ok(None);
        };

        // stored domains are lowercase and `normalize_host` lowercases the host
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants \
             WHERE enabled = 1 AND provisioning_state = ? \
             AND domain <> '' AND instr(?, domain) > 0 \
             ORDER BY length(domain) DESC, created_at ASC, id ASC LIMIT 1"
        ))
        .bind(ProvisioningState::NotificationSent.as_str())
        .bind(&host)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TenantRow::into_domain).transpose()
    }

    /// Returns the oldest live tenant.
    pub async fn find_first(&self) -> Result<Option<Tenant>, DirectoryError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants \
             WHERE enabled = 1 AND provisioning_state = ? \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        ))
        .bind(ProvisioningState::NotificationSent.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TenantRow::into_domain).transpose()
    }

    /// Looks up a live tenant by its exact domain.
    pub async fn find_live_by_exact_domain(
        &self,
        domain: &str,
    ) -> Result<Option<Tenant>, DirectoryError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants \
             WHERE domain = ? AND enabled = 1 AND provisioning_state = ?"
        ))
        .bind(domain.trim().to_ascii_lowercase())
        .bind(ProvisioningState::NotificationSent.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TenantRow::into_domain).transpose()
    }

    /// Loads a tenant by identifier regardless of its state.
    pub async fn fetch(&self, tenant_id: &str) -> Result<Tenant, DirectoryError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DirectoryError::NotFound)?;

        row.into_domain()
    }

    /// Returns `true` when an enabled tenant (live or not) holds the domain.
    pub async fn exists_enabled_domain(&self, domain: &str) -> Result<bool, DirectoryError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tenants WHERE domain = ? AND enabled = 1")
                .bind(domain.trim().to_ascii_lowercase())
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Moves the tenant to `state` and clears any recorded failure.
    pub async fn advance_provisioning(
        &self,
        tenant_id: &str,
        state: ProvisioningState,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        let result = sqlx::query(
            "UPDATE tenants \
             SET provisioning_state = ?, provisioning_error = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(to_rfc3339(at))
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound);
        }
        Ok(())
    }

    /// Stores the failure message of an interrupted provisioning.
    pub async fn record_provisioning_failure(
        &self,
        tenant_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        let result = sqlx::query(
            "UPDATE tenants SET provisioning_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(to_rfc3339(at))
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound);
        }
        Ok(())
    }

    /// Lists enabled tenants whose provisioning has not completed and that
    /// were last touched at or before `updated_before`.
    pub async fn list_incomplete(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Tenant>, DirectoryError> {
        let rows = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants \
             WHERE enabled = 1 AND provisioning_state <> ? AND updated_at <= ? \
             ORDER BY created_at ASC"
        ))
        .bind(ProvisioningState::NotificationSent.as_str())
        .bind(to_rfc3339(updated_before))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TenantRow::into_domain).collect()
    }

    /// Loads the founding administrator waiting to be created for a tenant.
    pub async fn pending_founder(
        &self,
        tenant_id: &str,
    ) -> Result<Option<PendingFounder>, DirectoryError> {
        let founder = sqlx::query_as::<_, PendingFounder>(
            "SELECT name, username, email, password_hash FROM pending_founders WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(founder)
    }

    /// Removes the pending founder once the administrator account exists.
    pub async fn clear_pending_founder(&self, tenant_id: &str) -> Result<(), DirectoryError> {
        sqlx::query("DELETE FROM pending_founders WHERE tenant_id = ?")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_insert_error(err: sqlx::Error) -> DirectoryError {
    if is_unique_violation(&err) {
        DirectoryError::DuplicateDomain
    } else {
        DirectoryError::Database(err)
    }
}

/// Data required to register a new tenant.
#[derive(Debug, Clone)]
pub struct NewTenant<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub domain: &'a str,
    pub connection: &'a str,
    pub locales: &'a [String],
    pub created_at: DateTime<Utc>,
}

/// Founding administrator stored until the tenant database holds the account.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingFounder {
    pub name: String,
    pub username: String,
    pub email: String,
    /// Argon2 PHC string; the plaintext password is never stored.
    pub password_hash: String,
}

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    id: String,
    name: String,
    domain: String,
    connection: String,
    enabled: bool,
    locales_json: String,
    created_at: DateTime<Utc>,
    provisioning_state: String,
    provisioning_error: Option<String>,
}

impl TenantRow {
    fn into_domain(self) -> Result<Tenant, DirectoryError> {
        let locales: Vec<String> = serde_json::from_str(&self.locales_json)
            .map_err(|err| DirectoryError::Decode(format!("locales of {}: {err}", self.id)))?;
        let provisioning_state = self
            .provisioning_state
            .parse::<ProvisioningState>()
            .map_err(|err| DirectoryError::Decode(err.to_string()))?;

        Ok(Tenant {
            id: self.id,
            name: self.name,
            domain: self.domain,
            connection: self.connection,
            enabled: self.enabled,
            locales,
            created_at: self.created_at,
            provisioning_state,
            provisioning_error: self.provisioning_error,
        })
    }
}

/// Errors returned by the tenant directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("an enabled tenant already uses this domain")]
    DuplicateDomain,
    #[error("tenant not found")]
    NotFound,
    #[error("failed to decode tenant record: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
