use std::sync::{Arc, Mutex};

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{Binary, Integer, Text};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use futures::future::BoxFuture;
use tracing::debug;

use super::{KvStore, StoreError};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, QueryableByName)]
struct EntryRow {
    #[diesel(sql_type = Text)]
    key: String,
    #[diesel(sql_type = Binary)]
    value: Vec<u8>,
}

/// SQLite-backed store using a single `kv_entries` table.
///
/// Diesel's SQLite connection is synchronous, so every operation runs on the blocking pool
/// behind one shared connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and applies pending migrations.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let mut conn = SqliteConnection::establish(path)
            .map_err(|err| StoreError::Backend(format!("failed to open {path}: {err}")))?;

        conn.batch_execute(
            r#"
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = FULL;
            "#,
        )
        .map_err(backend_error)?;

        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| StoreError::Backend(format!("failed to run migrations: {err}")))?;
        debug!(
            event = "sqlite_store_opened",
            path,
            applied_migrations = applied.len(),
            "opened sqlite store"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, diesel::result::Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))?;
            op(&mut *guard).map_err(backend_error)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn backend_error(err: diesel::result::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl KvStore for SqliteStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut rows = self
                .with_conn(move |conn| {
                    sql_query("SELECT key, value FROM kv_entries WHERE key = ?")
                        .bind::<Text, _>(key)
                        .load::<EntryRow>(conn)
                })
                .await?;
            Ok(rows.pop().map(|row| row.value))
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.with_conn(move |conn| {
                sql_query(
                    "INSERT INTO kv_entries (key, value) VALUES (?, ?) \
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                )
                .bind::<Text, _>(key)
                .bind::<Binary, _>(value)
                .execute(conn)
            })
            .await?;
            Ok(())
        })
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<(String, Vec<u8>)>, StoreError>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let prefix_len = i32::try_from(prefix.chars().count()).map_err(|_| {
                StoreError::Backend("scan prefix is too long for sqlite substr".to_string())
            })?;
            let rows = self
                .with_conn(move |conn| {
                    sql_query(
                        "SELECT key, value FROM kv_entries \
                         WHERE substr(key, 1, ?) = ? ORDER BY key",
                    )
                    .bind::<Integer, _>(prefix_len)
                    .bind::<Text, _>(prefix)
                    .load::<EntryRow>(conn)
                })
                .await?;
            Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteStore;
    use crate::store::KvStore;

    #[tokio::test]
    async fn put_overwrites_existing_value() {
        let store = SqliteStore::open_in_memory().expect("open sqlite");
        store.put("k", vec![1, 2]).await.expect("first put");
        store.put("k", vec![3]).await.expect("second put");
        assert_eq!(store.get("k").await.expect("get"), Some(vec![3]));
        assert_eq!(store.get("missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn scan_prefix_filters_and_orders() {
        let store = SqliteStore::open_in_memory().expect("open sqlite");
        store.put("x!b", vec![2]).await.expect("put");
        store.put("x!a", vec![1]).await.expect("put");
        store.put("x", vec![0]).await.expect("put");
        store.put("y!a", vec![9]).await.expect("put");

        let rows = store.scan_prefix("x!").await.expect("scan");
        assert_eq!(
            rows,
            vec![("x!a".to_string(), vec![1]), ("x!b".to_string(), vec![2])]
        );
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sieve.db");
        let path = path.to_str().expect("utf8 path");

        {
            let store = SqliteStore::open(path).expect("open");
            store.put("head", vec![0, 0, 0, 7]).await.expect("put");
        }

        let reopened = SqliteStore::open(path).expect("reopen");
        assert_eq!(
            reopened.get("head").await.expect("get"),
            Some(vec![0, 0, 0, 7])
        );
    }
}
