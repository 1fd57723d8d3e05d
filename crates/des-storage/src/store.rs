//! Data Store Handle.
//!
//! A [`StoreHandle`] wraps exactly one redb database: a device's command
//! archive or one job. Rows are keyed by `(time, row_id)` so the last key of
//! a table is always the latest record by time.
//!
//! Writes may run on the blocking pool ([`StoreHandle::create_in_background`]).
//! Every operation registers with the handle's [`PendingOps`] barrier and
//! [`StoreHandle::disconnect`] waits on it, so no write is ever attempted
//! against a closed database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use des_core::codes::{EventType, EventTypeCatalog};
use des_core::models::{
    AdminSettings, ConfigSettings, EventRecord, HeaderInfo, SampleRecord, StateSnapshot,
};
use parking_lot::RwLock;
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError, TableHandle,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pending::PendingOps;
use crate::{Error, Result};

/// `(time millis, row id)`.
pub type RowKey = (i64, u64);

pub mod tables {
    use super::RowKey;
    use redb::TableDefinition;

    pub const ADMINS: TableDefinition<RowKey, &[u8]> = TableDefinition::new("admins");
    pub const STATES: TableDefinition<RowKey, &[u8]> = TableDefinition::new("states");
    pub const HEADERS: TableDefinition<RowKey, &[u8]> = TableDefinition::new("headers");
    pub const CONFIGS: TableDefinition<RowKey, &[u8]> = TableDefinition::new("configs");
    pub const EVENTS: TableDefinition<RowKey, &[u8]> = TableDefinition::new("events");
    pub const SAMPLES: TableDefinition<RowKey, &[u8]> = TableDefinition::new("samples");

    // code -> display name
    pub const EVENT_TYPES: TableDefinition<i32, &str> = TableDefinition::new("event_types");

    pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
}

const NEXT_ROW_ID: &str = "next_row_id";

/// A record kind with its own time-ordered table.
pub trait StoreRecord: Serialize + DeserializeOwned + Send + 'static {
    fn table() -> TableDefinition<'static, RowKey, &'static [u8]>;

    /// Ordering time in unix millis.
    fn time(&self) -> i64;

    /// Receives the row id assigned on insert.
    fn set_id(&mut self, _id: i64) {}
}

macro_rules! snapshot_record {
    ($ty:ty, $table:expr) => {
        impl StoreRecord for $ty {
            fn table() -> TableDefinition<'static, RowKey, &'static [u8]> {
                $table
            }

            fn time(&self) -> i64 {
                self.source.time
            }

            fn set_id(&mut self, id: i64) {
                self.id = id;
            }
        }
    };
}

snapshot_record!(AdminSettings, tables::ADMINS);
snapshot_record!(StateSnapshot, tables::STATES);
snapshot_record!(HeaderInfo, tables::HEADERS);
snapshot_record!(ConfigSettings, tables::CONFIGS);
snapshot_record!(EventRecord, tables::EVENTS);

impl StoreRecord for SampleRecord {
    fn table() -> TableDefinition<'static, RowKey, &'static [u8]> {
        tables::SAMPLES
    }

    fn time(&self) -> i64 {
        self.time
    }
}

/// Connection wrapper around one named database.
pub struct StoreHandle {
    name: String,
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
    pending: Arc<PendingOps>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.in_flight())
            .finish()
    }
}

impl StoreHandle {
    /// Create an unconnected handle.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            db: RwLock::new(None),
            pending: PendingOps::new(),
        }
    }

    /// Create a handle and connect it.
    pub fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let handle = Self::new(name, path);
        handle.connect()?;
        Ok(Arc::new(handle))
    }

    /// Job name this store belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.db.read().is_some()
    }

    pub fn pending(&self) -> usize {
        self.pending.in_flight()
    }

    /// Open the database file, creating it if needed. No-op when connected.
    pub fn connect(&self) -> Result<()> {
        let mut slot = self.db.write();
        if slot.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&self.path)?;
        *slot = Some(Arc::new(db));
        info!(store = %self.name, path = %self.path.display(), "Store connected");
        Ok(())
    }

    /// Close the database once every in-flight operation has finished.
    ///
    /// New operations fail with [`Error::Disconnected`] as soon as this is
    /// called; operations already registered complete against the open
    /// database.
    pub async fn disconnect(&self) {
        let db = self.db.write().take();
        let Some(db) = db else {
            return;
        };
        let in_flight = self.pending.in_flight();
        if in_flight > 0 {
            debug!(store = %self.name, in_flight, "Waiting for pending writes");
        }
        self.pending.wait_idle().await;
        drop(db);
        info!(store = %self.name, "Store disconnected");
    }

    /// Wait for every in-flight operation without disconnecting.
    pub async fn drain(&self) {
        self.pending.wait_idle().await;
    }

    fn database(&self) -> Result<Arc<Database>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| Error::Disconnected(self.name.clone()))
    }

    /// Insert a record, returning it with its row id set.
    pub fn create<R: StoreRecord>(&self, record: R) -> Result<R> {
        let guard = self.pending.enter();
        let result = self.database().and_then(|db| insert(&db, record));
        drop(guard);
        result
    }

    /// Insert on the blocking pool.
    ///
    /// The write is registered with the barrier before this returns, so a
    /// later [`disconnect`](Self::disconnect) waits for it to commit.
    pub fn create_in_background<R: StoreRecord>(&self, record: R) -> JoinHandle<Result<R>> {
        let guard = self.pending.enter();
        let db = self.database();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let result = db.and_then(|db| {
                let result = insert(&db, record);
                // Release the connection before the barrier.
                drop(db);
                result
            });
            if let Err(e) = &result {
                warn!(store = %name, error = %e, "Background write failed");
            }
            drop(guard);
            result
        })
    }

    /// Latest record by time.
    pub fn last<R: StoreRecord>(&self) -> Result<R> {
        let guard = self.pending.enter();
        let result = self.database().and_then(|db| {
            let txn = db.begin_read()?;
            let table = match txn.open_table(R::table()) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(t)) => {
                    return Err(Error::NotFound(format!("{}/{}", self.name, t)))
                }
                Err(e) => return Err(e.into()),
            };
            let latest = match table.last()? {
                Some((_, value)) => Ok(serde_json::from_slice(value.value())?),
                None => Err(Error::NotFound(format!(
                    "{}/{}",
                    self.name,
                    R::table().name()
                ))),
            };
            latest
        });
        drop(guard);
        result
    }

    /// Records with `start <= time <= end`, oldest first.
    pub fn query<R: StoreRecord>(&self, start: i64, end: i64) -> Result<Vec<R>> {
        let guard = self.pending.enter();
        let result = self.database().and_then(|db| {
            let txn = db.begin_read()?;
            let table = match txn.open_table(R::table()) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut out = Vec::new();
            for entry in table.range((start, 0u64)..=(end, u64::MAX))? {
                let (_, value) = entry?;
                out.push(serde_json::from_slice(value.value())?);
            }
            Ok(out)
        });
        drop(guard);
        result
    }

    pub fn all<R: StoreRecord>(&self) -> Result<Vec<R>> {
        self.query(i64::MIN, i64::MAX)
    }

    pub fn count<R: StoreRecord>(&self) -> Result<u64> {
        let guard = self.pending.enter();
        let result = self.database().and_then(|db| {
            let txn = db.begin_read()?;
            match txn.open_table(R::table()) {
                Ok(table) => Ok(table.len()?),
                Err(TableError::TableDoesNotExist(_)) => Ok(0),
                Err(e) => Err(e.into()),
            }
        });
        drop(guard);
        result
    }

    /// Create every table so readers never see a missing one.
    pub fn init_schema(&self) -> Result<()> {
        let guard = self.pending.enter();
        let result = self.database().and_then(|db| {
            let txn = db.begin_write()?;
            {
                txn.open_table(tables::ADMINS)?;
                txn.open_table(tables::STATES)?;
                txn.open_table(tables::HEADERS)?;
                txn.open_table(tables::CONFIGS)?;
                txn.open_table(tables::EVENTS)?;
                txn.open_table(tables::SAMPLES)?;
                txn.open_table(tables::EVENT_TYPES)?;
                txn.open_table(tables::META)?;
            }
            txn.commit()?;
            Ok(())
        });
        drop(guard);
        result
    }

    /// Seed the `event_types` table. Rows that fail are logged and skipped.
    ///
    /// Returns the number of rows written.
    pub fn seed_event_types(&self, catalog: &EventTypeCatalog) -> Result<usize> {
        let guard = self.pending.enter();
        let result = self.database().and_then(|db| {
            let txn = db.begin_write()?;
            let mut written = 0;
            {
                let mut table = txn.open_table(tables::EVENT_TYPES)?;
                for et in catalog.event_types() {
                    match table.insert(et.code, et.name.as_str()) {
                        Ok(_) => written += 1,
                        Err(e) => warn!(
                            store = %self.name,
                            code = et.code,
                            error = %e,
                            "Failed to seed event type"
                        ),
                    }
                }
            }
            txn.commit()?;
            Ok(written)
        });
        drop(guard);
        result
    }

    pub fn event_types(&self) -> Result<Vec<EventType>> {
        let guard = self.pending.enter();
        let result = self.database().and_then(|db| {
            let txn = db.begin_read()?;
            let table = match txn.open_table(tables::EVENT_TYPES) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (code, name) = entry?;
                out.push(EventType {
                    code: code.value(),
                    name: name.value().to_string(),
                });
            }
            Ok(out)
        });
        drop(guard);
        result
    }
}

fn insert<R: StoreRecord>(db: &Database, mut record: R) -> Result<R> {
    let txn = db.begin_write()?;
    {
        let mut meta = txn.open_table(tables::META)?;
        let id = meta.get(NEXT_ROW_ID)?.map(|v| v.value()).unwrap_or(1);
        meta.insert(NEXT_ROW_ID, id + 1)?;

        record.set_id(id as i64);
        let bytes = serde_json::to_vec(&record)?;
        let mut table = txn.open_table(R::table())?;
        table.insert((record.time(), id), bytes.as_slice())?;
    }
    txn.commit()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use des_core::models::Source;

    fn temp_handle() -> (tempfile::TempDir, StoreHandle) {
        let dir = tempfile::tempdir().unwrap();
        let handle = StoreHandle::new("demo42_cmdarchive", dir.path().join("demo42_cmdarchive.redb"));
        handle.connect().unwrap();
        (dir, handle)
    }

    #[test]
    fn test_last_is_latest_by_time() {
        let (_dir, store) = temp_handle();
        for t in [30, 10, 20] {
            let mut header = HeaderInfo::defaults("DEMO42", Source::server(t));
            header.well_name = format!("well-{}", t);
            store.create(header).unwrap();
        }
        let latest: HeaderInfo = store.last().unwrap();
        assert_eq!(latest.well_name, "well-30");
        assert!(latest.id > 0);
        assert_eq!(store.count::<HeaderInfo>().unwrap(), 3);
    }

    #[test]
    fn test_last_on_empty_table_is_not_found() {
        let (_dir, store) = temp_handle();
        assert!(store.last::<ConfigSettings>().unwrap_err().is_not_found());
        store.init_schema().unwrap();
        assert!(store.last::<ConfigSettings>().unwrap_err().is_not_found());
    }

    #[test]
    fn test_query_window() {
        let (_dir, store) = temp_handle();
        for t in 0..10 {
            store
                .create(SampleRecord {
                    time: t * 100,
                    ..Default::default()
                })
                .unwrap();
        }
        let window: Vec<SampleRecord> = store.query(200, 500).unwrap();
        assert_eq!(
            window.iter().map(|s| s.time).collect::<Vec<_>>(),
            vec![200, 300, 400, 500]
        );
    }

    #[test]
    fn test_seed_event_types() {
        let (_dir, store) = temp_handle();
        store.init_schema().unwrap();
        let catalog = EventTypeCatalog::standard();
        assert_eq!(store.seed_event_types(&catalog).unwrap(), catalog.len());
        assert_eq!(store.event_types().unwrap().len(), catalog.len());
    }

    #[tokio::test]
    async fn test_create_after_disconnect_fails() {
        let (_dir, store) = temp_handle();
        store.disconnect().await;
        assert!(!store.is_connected());
        let err = store
            .create(SampleRecord::default())
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (_dir, store) = temp_handle();
        store.create(SampleRecord::default()).unwrap();
        store.disconnect().await;
        store.connect().unwrap();
        assert_eq!(store.count::<SampleRecord>().unwrap(), 1);
    }
}
