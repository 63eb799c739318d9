mod directory;
mod factory;
mod tenant_db;

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use thiserror::Error;

pub use directory::{Directory, DirectoryError, NewTenant, PendingFounder, TenantRepository};
pub use factory::{FactoryError, TenantDataContextFactory, FALLBACK_SCOPE};
pub use tenant_db::{
    Account, AccountError, AccountRepository, NewAccount, NewPatient, Patient, PatientError,
    PatientRepository, TenantDatabase,
};

/// Opens a SQLite pool for the provided connection string.
///
/// The database file is created when missing. Every pooled connection gets
/// WAL journaling, foreign keys and a busy timeout.
async fn connect_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(StorageError::Connect)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(StorageError::Connect)
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("2067"),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tempfile::TempDir;

    pub fn sqlite_url(dir: &TempDir, name: &str) -> String {
        format!("sqlite://{}", dir.path().join(name).display())
    }
}
