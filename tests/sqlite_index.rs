use std::sync::{Arc, Mutex};
use std::time::Duration;

use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{Binary, Text};
use feed_sieve_lib::feed::{Feed, MemoryFeed};
use feed_sieve_lib::index::{ConsumerError, Entry, IndexBuilder, IndexHandle};
use feed_sieve_lib::store::SqliteStore;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(QueryableByName)]
struct EntryRow {
    #[diesel(sql_type = Text)]
    key: String,
    #[diesel(sql_type = Binary)]
    value: Vec<u8>,
}

type Seen = Arc<Mutex<Vec<(u64, String)>>>;

fn start(db_path: &str, feed: &MemoryFeed, seen: &Seen) -> IndexHandle {
    let store = SqliteStore::open(db_path).expect("failed to open sqlite store");
    let seen = Arc::clone(seen);
    IndexBuilder::new()
        .store(store)
        .feed(feed.clone())
        .consumer(move |entry: Entry| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock()
                    .expect("seen mutex poisoned")
                    .push((entry.index, String::from_utf8_lossy(&entry.data).into_owned()));
                Ok::<(), ConsumerError>(())
            }
        })
        .key_prefix("demo/")
        .start()
        .expect("valid config")
}

async fn wait_for(seen: &Seen, count: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while seen.lock().expect("seen mutex poisoned").len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for deliveries");
}

fn origin() -> MemoryFeed {
    let origin = MemoryFeed::new();
    origin
        .append_batch(["hello", "hi", "hej", "hallo", "heysan"])
        .expect("failed to build origin");
    origin
}

#[tokio::test]
async fn sparse_replica_resumes_from_sqlite_after_restart() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("sieve.sqlite3");
    let db_path = db_path.to_str().expect("utf-8 temp path");
    let origin = origin();

    let replica = MemoryFeed::replica();
    let first: Seen = Arc::default();
    let handle = start(db_path, &replica, &first);
    for index in [0, 3, 4] {
        replica.fetch_from(&origin, index).await.expect("fetch");
    }
    wait_for(&first, 3).await;
    replica.close();
    tokio::time::timeout(TIMEOUT, handle.wait())
        .await
        .expect("first run did not finish")
        .expect("first run failed");

    let mut delivered = first.lock().expect("seen mutex poisoned").clone();
    delivered.sort();
    assert_eq!(
        delivered,
        vec![
            (0, "hello".to_string()),
            (3, "hallo".to_string()),
            (4, "heysan".to_string()),
        ]
    );

    // Restart over the same file with a replica that has everything locally.
    let full_replica = MemoryFeed::replica();
    for index in 0..5 {
        full_replica.fetch_from(&origin, index).await.expect("fetch");
    }
    let second: Seen = Arc::default();
    let handle = start(db_path, &full_replica, &second);
    wait_for(&second, 2).await;
    full_replica.close();
    tokio::time::timeout(TIMEOUT, handle.wait())
        .await
        .expect("second run did not finish")
        .expect("second run failed");

    let mut delivered = second.lock().expect("seen mutex poisoned").clone();
    delivered.sort();
    assert_eq!(delivered, vec![(1, "hi".to_string()), (2, "hej".to_string())]);
}

#[tokio::test]
async fn sieve_rows_use_prefixed_keys() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("sieve.sqlite3");
    let db_path = db_path.to_str().expect("utf-8 temp path");

    let feed = origin();
    let seen: Seen = Arc::default();
    let handle = start(db_path, &feed, &seen);
    wait_for(&seen, 5).await;
    feed.close();
    tokio::time::timeout(TIMEOUT, handle.wait())
        .await
        .expect("run did not finish")
        .expect("run failed");

    let mut conn = SqliteConnection::establish(db_path).expect("failed to open sqlite file");
    let rows: Vec<EntryRow> = sql_query("SELECT key, value FROM kv_entries ORDER BY key")
        .load(&mut conn)
        .expect("failed to read kv_entries");

    let keys: Vec<&str> = rows.iter().map(|row| row.key.as_str()).collect();
    assert_eq!(keys, vec!["demo/sieve!chunk!0000000000000000", "demo/sieve!head"]);
    assert_eq!(rows[0].value[0], 0b1111_1000);
    assert_eq!(rows[1].value, 5u64.to_be_bytes().to_vec());
}

/// Runs the demo flow: a replica sized from the origin, indexed before any block is fetched.
async fn index_sparse_fetches(db_path: &str, origin: &MemoryFeed, fetch: &[u64]) -> Vec<(u64, String)> {
    let replica = MemoryFeed::replica();
    replica.grow(origin.len()).expect("grow replica");

    let seen: Seen = Arc::default();
    let handle = start(db_path, &replica, &seen);
    // Let catch-up run against the still-empty replica.
    tokio::time::sleep(Duration::from_millis(20)).await;

    for index in fetch {
        replica.fetch_from(origin, *index).await.expect("fetch");
    }
    wait_for(&seen, fetch.len()).await;
    replica.close();
    tokio::time::timeout(TIMEOUT, handle.wait())
        .await
        .expect("run did not finish")
        .expect("run failed");

    let mut delivered = seen.lock().expect("seen mutex poisoned").clone();
    delivered.sort();
    delivered
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_with_unfetched_replica_catches_up_cleanly() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("sieve.sqlite3");
    let db_path = db_path.to_str().expect("utf-8 temp path");
    let origin = origin();

    let first = index_sparse_fetches(db_path, &origin, &[0, 3, 4]).await;
    assert_eq!(
        first,
        vec![
            (0, "hello".to_string()),
            (3, "hallo".to_string()),
            (4, "heysan".to_string()),
        ]
    );

    let second = index_sparse_fetches(db_path, &origin, &[1, 2]).await;
    assert_eq!(second, vec![(1, "hi".to_string()), (2, "hej".to_string())]);
}
