use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;

use crate::site::UserAuth;

#[derive(Debug, Error)]
pub enum Error {
    #[error("application_id mismatch: expected {expected}, found {found}")]
    ApplicationId { expected: i32, found: i64 },
    #[error("breaking schema version {found}, supported {supported}")]
    Breaking { found: u32, supported: u32 },
    #[error("malformed auth file: {0}")]
    Auth(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Fails when the found schema's major version differs from the supported
/// one. Versions are encoded as `major * 1_000_000 + minor * 1_000 + patch`
/// in SQLite's `user_version` pragma.
pub fn check_breaking(found: u32, supported: u32) -> Result<(), Error> {
    if found / 1_000_000 != supported / 1_000_000 {
        return Err(Error::Breaking { found, supported });
    }
    Ok(())
}

/// Schema bootstrap for one database file, keyed on the `application_id`
/// pragma so we never write into some other application's database.
pub struct Migrations {
    pub application_id: i32,
    pub latest: u32,
    pub ddl: &'static [&'static str],
}

impl Migrations {
    /// Returns the schema version without migrating. A pristine database
    /// reports version 0.
    pub async fn get_version(&self, conn: &mut SqliteConnection) -> Result<u32, Error> {
        let user_version: i64 = sqlx::query_scalar("pragma user_version")
            .fetch_one(&mut *conn)
            .await?;
        if user_version == 0 {
            return Ok(0);
        }

        let application_id: i64 = sqlx::query_scalar("pragma application_id")
            .fetch_one(&mut *conn)
            .await?;
        if application_id != self.application_id as i64 {
            return Err(Error::ApplicationId {
                expected: self.application_id,
                found: application_id,
            });
        }

        Ok(user_version as u32)
    }

    /// Brings the connection's schema to the latest version, creating it
    /// from scratch on a pristine database. Fails on an application-id or
    /// breaking-version mismatch.
    pub async fn upgrade(&self, conn: &mut SqliteConnection) -> Result<u32, Error> {
        let version = self.get_version(conn).await?;
        if version != 0 {
            check_breaking(version, self.latest)?;
            return Ok(version);
        }

        for statement in self.ddl {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        sqlx::query(&format!("pragma application_id = {}", self.application_id))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!("pragma user_version = {}", self.latest))
            .execute(&mut *conn)
            .await?;

        Ok(self.latest)
    }
}

/// An idempotent change to one database, applied inside a writer
/// transaction.
#[async_trait]
pub trait Apply: Send + Sync {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error>;
}

/// Applies one update inside an `IMMEDIATE` transaction, upgrading the
/// schema first. The transaction is rolled back if the migration check or
/// the update fails.
pub async fn apply_in_write_txn(
    pool: &SqlitePool,
    migrations: &Migrations,
    update: &impl Apply,
) -> Result<(), Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let result = async {
        let version = migrations.upgrade(&mut conn).await?;
        check_breaking(version, migrations.latest)?;
        update.apply(&mut conn).await.map_err(Error::from)
    }
    .await;

    match result {
        Ok(()) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(())
        }
        Err(err) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(err)
        }
    }
}

/// Paths and factories for the cache directory's contents.
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(path: PathBuf) -> Storage {
        Storage { path }
    }

    pub fn auth_file_path(&self) -> PathBuf {
        self.path.join("auth.json")
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.path.join("metadata.db")
    }

    pub fn user_db_path(&self) -> PathBuf {
        self.path.join("user.db")
    }

    pub fn torrents_db_path(&self) -> PathBuf {
        self.path.join("torrents.db")
    }

    pub fn read_user_auth(&self) -> Result<UserAuth, Error> {
        let data = std::fs::read(self.auth_file_path())?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn open_metadata_pool(&self) -> Result<SqlitePool, Error> {
        open_pool(&self.metadata_db_path()).await
    }

    pub async fn open_user_pool(&self) -> Result<SqlitePool, Error> {
        open_pool(&self.user_db_path()).await
    }

    pub async fn open_torrents_pool(&self) -> Result<SqlitePool, Error> {
        open_pool(&self.torrents_db_path()).await
    }
}

/// Opens a pooled connection to one cache database. Metadata updates use
/// temp tables with small data sizes, hence the in-memory temp store.
pub async fn open_pool(path: &Path) -> Result<SqlitePool, Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .pragma("temp_store", "MEMORY")
        .pragma("trusted_schema", "OFF");

    Ok(SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?)
}

#[cfg(test)]
mod tests {
    use sqlx::ConnectOptions;

    use super::*;

    const TEST_MIGRATIONS: Migrations = Migrations {
        application_id: 12345,
        latest: 1_000_000,
        ddl: &["create table t (id integer primary key)"],
    };

    async fn memory_conn() -> SqliteConnection {
        SqliteConnectOptions::new()
            .in_memory(true)
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upgrade_creates_schema() {
        let mut conn = memory_conn().await;
        assert_eq!(TEST_MIGRATIONS.get_version(&mut conn).await.unwrap(), 0);
        assert_eq!(TEST_MIGRATIONS.upgrade(&mut conn).await.unwrap(), 1_000_000);

        sqlx::query("insert into t (id) values (1)")
            .execute(&mut conn)
            .await
            .unwrap();

        // Idempotent on an up-to-date database
        assert_eq!(TEST_MIGRATIONS.upgrade(&mut conn).await.unwrap(), 1_000_000);
    }

    #[tokio::test]
    async fn rejects_foreign_application_id() {
        let mut conn = memory_conn().await;
        TEST_MIGRATIONS.upgrade(&mut conn).await.unwrap();

        let other = Migrations {
            application_id: 99,
            latest: 1_000_000,
            ddl: &[],
        };
        match other.get_version(&mut conn).await {
            Err(Error::ApplicationId {
                expected: 99,
                found: 12345,
            }) => {}
            other => panic!("expected application id mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_breaking_version() {
        let mut conn = memory_conn().await;
        TEST_MIGRATIONS.upgrade(&mut conn).await.unwrap();
        sqlx::query("pragma user_version = 2000000")
            .execute(&mut conn)
            .await
            .unwrap();

        match TEST_MIGRATIONS.upgrade(&mut conn).await {
            Err(Error::Breaking {
                found: 2_000_000,
                supported: 1_000_000,
            }) => {}
            other => panic!("expected breaking version, got {other:?}"),
        }
    }

    #[test]
    fn storage_paths() {
        let storage = Storage::new(PathBuf::from("/tmp/btn"));
        assert_eq!(storage.metadata_db_path(), Path::new("/tmp/btn/metadata.db"));
        assert_eq!(storage.user_db_path(), Path::new("/tmp/btn/user.db"));
        assert_eq!(storage.auth_file_path(), Path::new("/tmp/btn/auth.json"));
    }
}
