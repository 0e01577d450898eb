#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use libsdk::{
    Fabric, FabricConfig, ReplayPolicy, SqliteDriver, SqliteFabric, Store, StoreConfig, TxHandler,
};

pub const SERVICE: &str = "personsvc";

pub fn migrations() -> Vec<String> {
    vec!["CREATE TABLE people (
        person_id INTEGER PRIMARY KEY,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE
    )"
    .to_string()]
}

pub fn insert_person() -> TxHandler {
    Arc::new(|tx, args| {
        let id = tx.read_write().exec(
            "INSERT INTO people (first_name, last_name, email) VALUES (?1, ?2, ?3)",
            args,
        )?;
        Ok(json!(id))
    })
}

pub fn get_person() -> TxHandler {
    Arc::new(|tx, args| {
        tx.read().get(
            "SELECT person_id, first_name, last_name, email FROM people WHERE person_id = ?1",
            args,
        )
    })
}

pub fn select_people() -> TxHandler {
    Arc::new(|tx, _| {
        let rows = tx.read().select(
            "SELECT person_id, first_name, last_name, email FROM people ORDER BY person_id LIMIT 10",
            &[],
        )?;
        Ok(Value::Array(rows))
    })
}

pub fn delete_person() -> TxHandler {
    Arc::new(|tx, args| {
        tx.read_write()
            .delete("DELETE FROM people WHERE person_id = ?1", args)?;
        Ok(Value::Null)
    })
}

pub fn count_people() -> TxHandler {
    Arc::new(|tx, _| {
        let row = tx.read().get("SELECT COUNT(*) AS n FROM people", &[])?;
        Ok(row["n"].clone())
    })
}

pub fn register_people(store: &Store) {
    store.register_handler("InsertPerson", insert_person()).unwrap();
    store.register_handler("GetPerson", get_person()).unwrap();
    store.register_handler("SelectPeople", select_people()).unwrap();
    store.register_handler("DeletePerson", delete_person()).unwrap();
    store.register_handler("CountPeople", count_people()).unwrap();
}

/// A file-backed fabric in its own temp directory, polling fast enough for
/// tests.
pub fn temp_fabric() -> (tempfile::TempDir, SqliteFabric) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let fabric = fabric_at(dir.path());
    (dir, fabric)
}

/// A second fabric instance over the same shared directory, as another
/// process connecting to the same stream would.
pub fn fabric_at(dir: &Path) -> SqliteFabric {
    SqliteFabric::connect_with(
        SERVICE,
        FabricConfig {
            data_dir: Some(dir.to_path_buf()),
            poll_interval: Duration::from_millis(2),
            ..FabricConfig::default()
        },
    )
    .expect("connect fabric")
}

/// A store with a fresh in-memory database over the given fabric, with the
/// person-domain handlers registered. Not yet started.
pub fn store_over(fabric: &dyn Fabric) -> Store {
    let driver = SqliteDriver::open_in_memory().expect("open in-memory driver");
    let replayer = fabric
        .replayer("store", ReplayPolicy::FromBeginning)
        .expect("open replayer");

    let store = Store::with_config(
        driver,
        replayer,
        StoreConfig {
            replication_timeout: Duration::from_secs(5),
        },
    );
    register_people(&store);
    store
}

/// Builds and starts a store over the given fabric.
pub async fn started_store(fabric: &dyn Fabric) -> Store {
    let store = store_over(fabric);
    store.start(&migrations()).await.expect("start store");
    store
}

/// Counts messages held on a full subject (e.g. `"personsvc.store"`) of a
/// file-backed stream.
pub fn stream_message_count(fabric: &SqliteFabric, full_subject: &str) -> i64 {
    let conn = rusqlite::Connection::open(fabric.path()).expect("open stream file");
    conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE subject = ?1",
        [full_subject],
        |row| row.get(0),
    )
    .expect("count messages")
}

/// Polls `f` until it returns `Some`, or panics after `timeout`.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
