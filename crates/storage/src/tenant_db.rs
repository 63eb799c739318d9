use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::{connect_pool, is_unique_violation, to_rfc3339, StorageError};

const ACCOUNT_COLUMNS: &str = "id, tenant_id, name, username, email, password_hash, role, \
                               email_confirmed, confirmation_token_hash, confirmation_expires_at, \
                               created_at, confirmed_at";

/// Data context bound to exactly one tenant's isolated database.
///
/// Cloning is cheap; clones share the pool and the tenant scope.
#[derive(Debug, Clone)]
pub struct TenantDatabase {
    tenant_id: Arc<str>,
    pool: SqlitePool,
}

impl TenantDatabase {
    /// Connects to the isolated database described by `connection`.
    pub async fn connect(tenant_id: &str, connection: &str) -> Result<Self, StorageError> {
        let pool = connect_pool(connection, 4).await?;
        Ok(Self {
            tenant_id: Arc::from(tenant_id),
            pool,
        })
    }

    /// Applies migrations located under `migrations/tenant`. Safe to repeat.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations/tenant")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Returns the account repository scoped to this tenant.
    pub fn accounts(&self) -> AccountRepository {
        AccountRepository {
            tenant_id: self.tenant_id.clone(),
            pool: self.pool.clone(),
        }
    }

    /// Returns the patient repository.
    pub fn patients(&self) -> PatientRepository {
        PatientRepository {
            pool: self.pool.clone(),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Identity store of one tenant.
///
/// Every statement binds the scope tenant id, so rows written under another
/// tenant id are never read or modified through this handle.
#[derive(Clone)]
pub struct AccountRepository {
    tenant_id: Arc<str>,
    pool: SqlitePool,
}

impl AccountRepository {
    /// Creates an account, or returns the existing one with the same username.
    pub async fn create_or_get(&self, account: &NewAccount<'_>) -> Result<Account, AccountError> {
        let id = ulid::Ulid::new().to_string();
        let result = sqlx::query(
            "INSERT INTO accounts \
             (id, tenant_id, name, username, email, password_hash, role, email_confirmed, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(&*self.tenant_id)
        .bind(account.name)
        .bind(account.username)
        .bind(account.email)
        .bind(account.password_hash)
        .bind(account.role)
        .bind(to_rfc3339(account.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.fetch(&id).await,
            Err(err) if is_unique_violation(&err) => self
                .find_by_username(account.username)
                .await?
                .ok_or(AccountError::NotFound),
            Err(err) => Err(AccountError::Database(err)),
        }
    }

    pub async fn fetch(&self, account_id: &str) -> Result<Account, AccountError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ? AND tenant_id = ?"
        ))
        .bind(account_id)
        .bind(&*self.tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AccountError::NotFound)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<Account>, AccountError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = ? AND tenant_id = ?"
        ))
        .bind(username)
        .bind(&*self.tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Lists accounts with the given role, oldest first.
    pub async fn list_by_role(&self, role: &str) -> Result<Vec<Account>, AccountError> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE role = ? AND tenant_id = ? \
             ORDER BY created_at ASC"
        ))
        .bind(role)
        .bind(&*self.tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    /// Stores a new confirmation token hash, replacing any previous one.
    ///
    /// Only unconfirmed accounts accept a token.
    pub async fn set_confirmation_token(
        &self,
        account_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AccountError> {
        let result = sqlx::query(
            "UPDATE accounts \
             SET confirmation_token_hash = ?, confirmation_expires_at = ? \
             WHERE id = ? AND tenant_id = ? AND email_confirmed = 0",
        )
        .bind(token_hash)
        .bind(to_rfc3339(expires_at))
        .bind(account_id)
        .bind(&*self.tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccountError::NotFound);
        }
        Ok(())
    }

    /// Marks the account confirmed if it still holds `token_hash`.
    ///
    /// The token is consumed by the same statement, so at most one caller
    /// observes `true` for a given token.
    pub async fn mark_confirmed(
        &self,
        account_id: &str,
        token_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AccountError> {
        let result = sqlx::query(
            "UPDATE accounts \
             SET email_confirmed = 1, confirmed_at = ?, \
                 confirmation_token_hash = NULL, confirmation_expires_at = NULL \
             WHERE id = ? AND tenant_id = ? AND email_confirmed = 0 \
               AND confirmation_token_hash = ? AND confirmation_expires_at > ?",
        )
        .bind(to_rfc3339(at))
        .bind(account_id)
        .bind(&*self.tenant_id)
        .bind(token_hash)
        .bind(to_rfc3339(at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Parameters required to create an account.
pub struct NewAccount<'a> {
    pub name: &'a str,
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub role: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Account row of a tenant's identity store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub email_confirmed: bool,
    pub confirmation_token_hash: Option<String>,
    pub confirmation_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Errors raised by the account repository.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the tenant's patient records.
#[derive(Clone)]
pub struct PatientRepository {
    pool: SqlitePool,
}

impl PatientRepository {
    pub async fn insert(&self, patient: &NewPatient<'_>) -> Result<Patient, PatientError> {
        let row = sqlx::query_as::<_, Patient>(
            "INSERT INTO patients (id, full_name, phone, created_at) VALUES (?, ?, ?, ?) \
             RETURNING id, full_name, phone, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(patient.full_name)
        .bind(patient.phone)
        .bind(to_rfc3339(patient.created_at))
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Lists patients, newest first.
    pub async fn list(&self, limit: u32) -> Result<Vec<Patient>, PatientError> {
        let rows = sqlx::query_as::<_, Patient>(
            "SELECT id, full_name, phone, created_at FROM patients \
             ORDER BY created_at DESC, id ASC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Parameters required to insert a patient.
pub struct NewPatient<'a> {
    pub full_name: &'a str,
    pub phone: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, sqlx::FromRow)]
pub struct Patient {
    pub id: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum PatientError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
