//! Central registry database.
//!
//! Holds every device identity, every job record (archive and logging jobs)
//! and one denormalized search summary per job for the reporting side.

use std::path::Path;
use std::sync::Arc;

use des_core::models::{
    AdminSettings, ConfigSettings, DeviceRecord, HeaderInfo, JobRecord, StateSnapshot,
};
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

pub const REGISTRY_FILE: &str = "registry.redb";

// serial -> DeviceRecord (JSON)
const DEVICES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("devices");

// job name -> JobRecord (JSON)
const JOBS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("jobs");

// job name -> JobSearchRecord (JSON)
const JOB_SEARCH_TABLE: TableDefinition<&str, &str> = TableDefinition::new("job_search");

/// Search summary of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSearchRecord {
    pub job_name: String,
    pub serial: String,
    /// Space-joined lower-cased search terms.
    pub token: String,
    /// Latest admin/header/config/state at the time of the update.
    pub snapshot: serde_json::Value,
    pub updated: i64,
}

impl JobSearchRecord {
    pub fn build(
        job: &JobRecord,
        admin: &AdminSettings,
        header: &HeaderInfo,
        config: &ConfigSettings,
        state: &StateSnapshot,
        updated: i64,
    ) -> Self {
        let token = [
            job.serial.as_str(),
            job.name.as_str(),
            header.company.as_str(),
            header.supervisor.as_str(),
            header.contractor.as_str(),
            header.well_name.as_str(),
            header.well_location.as_str(),
            header.well_field.as_str(),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

        Self {
            job_name: job.name.clone(),
            serial: job.serial.clone(),
            token,
            snapshot: serde_json::json!({
                "admin": admin,
                "header": header,
                "config": config,
                "state": state,
            }),
            updated,
        }
    }

    pub fn matches(&self, term: &str) -> bool {
        self.token.contains(&term.to_lowercase())
    }
}

/// Registry store using redb.
pub struct RegistryStore {
    db: Arc<Database>,
}

impl RegistryStore {
    /// Open or create the registry at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        {
            txn.open_table(DEVICES_TABLE)?;
            txn.open_table(JOBS_TABLE)?;
            txn.open_table(JOB_SEARCH_TABLE)?;
        }
        txn.commit()?;

        info!(path = %path.display(), "Registry database opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Open `registry.redb` inside `data_dir`.
    pub fn open_in<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        Self::open(data_dir.as_ref().join(REGISTRY_FILE))
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<'static, &'static str, &'static str>,
        key: &str,
    ) -> Result<Option<T>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(table) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(
        &self,
        table: TableDefinition<'static, &'static str, &'static str>,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table)?;
            table.insert(key, json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn scan_json<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<'static, &'static str, &'static str>,
    ) -> Result<Vec<T>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(table) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(serde_json::from_str(value.value())?);
        }
        Ok(out)
    }

    /// Insert a new device. Fails if the serial is already registered.
    pub fn insert_device(&self, device: &DeviceRecord) -> Result<()> {
        let json = serde_json::to_string(device)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DEVICES_TABLE)?;
            if table.get(device.serial.as_str())?.is_some() {
                return Err(Error::AlreadyExists(device.serial.clone()));
            }
            table.insert(device.serial.as_str(), json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_device(&self, serial: &str) -> Result<Option<DeviceRecord>> {
        self.get_json(DEVICES_TABLE, serial)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.scan_json(DEVICES_TABLE)
    }

    /// Insert or overwrite a job. The archive job is always stored open.
    pub fn put_job(&self, job: &JobRecord) -> Result<()> {
        if job.is_archive() && job.end != 0 {
            let mut job = job.clone();
            job.end = 0;
            return self.put_json(JOBS_TABLE, &job.name, &job);
        }
        self.put_json(JOBS_TABLE, &job.name, job)
    }

    pub fn get_job(&self, name: &str) -> Result<Option<JobRecord>> {
        self.get_json(JOBS_TABLE, name)
    }

    /// Every job of a device, oldest start first.
    pub fn list_jobs(&self, serial: &str) -> Result<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .scan_json::<JobRecord>(JOBS_TABLE)?
            .into_iter()
            .filter(|j| j.serial == serial)
            .collect();
        jobs.sort_by_key(|j| j.start);
        Ok(jobs)
    }

    /// The device's open logging job, if any. Latest start wins.
    pub fn open_job(&self, serial: &str) -> Result<Option<JobRecord>> {
        Ok(self
            .list_jobs(serial)?
            .into_iter()
            .filter(|j| !j.is_archive() && j.is_open())
            .last())
    }

    /// Set a job's end time.
    pub fn end_job(&self, name: &str, end: i64) -> Result<JobRecord> {
        let mut job = self
            .get_job(name)?
            .ok_or_else(|| Error::NotFound(format!("job {}", name)))?;
        job.end = end;
        self.put_job(&job)?;
        Ok(job)
    }

    pub fn put_search(&self, record: &JobSearchRecord) -> Result<()> {
        self.put_json(JOB_SEARCH_TABLE, &record.job_name, record)
    }

    pub fn get_search(&self, job_name: &str) -> Result<Option<JobSearchRecord>> {
        self.get_json(JOB_SEARCH_TABLE, job_name)
    }

    pub fn search(&self, term: &str) -> Result<Vec<JobSearchRecord>> {
        Ok(self
            .scan_json::<JobSearchRecord>(JOB_SEARCH_TABLE)?
            .into_iter()
            .filter(|r| r.matches(term))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use des_core::models::{archive_name, job_name, Source};

    fn device(serial: &str) -> DeviceRecord {
        DeviceRecord {
            serial: serial.to_string(),
            class: "001".to_string(),
            version: "001".to_string(),
            reg: Source::new(1_000, "10.0.0.1", "u-1", "test"),
        }
    }

    fn job(serial: &str, start: i64) -> JobRecord {
        JobRecord {
            name: job_name(serial, start),
            serial: serial.to_string(),
            reg: Source::server(start),
            start,
            end: 0,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    #[test]
    fn test_device_insert_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegistryStore::open_in(dir.path()).unwrap();

        registry.insert_device(&device("DEMO42")).unwrap();
        assert!(matches!(
            registry.insert_device(&device("DEMO42")),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(registry.list_devices().unwrap().len(), 1);
        assert!(registry.get_device("OTHER").unwrap().is_none());
    }

    #[test]
    fn test_archive_never_ends() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegistryStore::open_in(dir.path()).unwrap();

        let mut archive = JobRecord::archive(&device("DEMO42"));
        archive.end = 99;
        registry.put_job(&archive).unwrap();
        let stored = registry.get_job(&archive_name("DEMO42")).unwrap().unwrap();
        assert_eq!(stored.end, 0);
    }

    #[test]
    fn test_open_job() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegistryStore::open_in(dir.path()).unwrap();

        registry.put_job(&JobRecord::archive(&device("DEMO42"))).unwrap();
        assert!(registry.open_job("DEMO42").unwrap().is_none());

        registry.put_job(&job("DEMO42", 10)).unwrap();
        registry.put_job(&job("DEMO42", 20)).unwrap();
        registry.end_job(&job_name("DEMO42", 10), 15).unwrap();

        let open = registry.open_job("DEMO42").unwrap().unwrap();
        assert_eq!(open.start, 20);
        assert_eq!(registry.list_jobs("DEMO42").unwrap().len(), 3);
    }

    #[test]
    fn test_search_token() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegistryStore::open_in(dir.path()).unwrap();

        let job = job("DEMO42", 10);
        let mut header = HeaderInfo::defaults("DEMO42", Source::server(10));
        header.company = "Acme Energy".to_string();
        header.well_name = "Pad 7".to_string();
        let record = JobSearchRecord::build(
            &job,
            &AdminSettings::defaults("DEMO42", Source::server(10)),
            &header,
            &ConfigSettings::defaults("DEMO42", Source::server(10)),
            &StateSnapshot::defaults("DEMO42", Source::server(10)),
            10,
        );
        assert_eq!(record.token, "demo42 demo42_10 acme energy pad 7");
        registry.put_search(&record).unwrap();

        assert_eq!(registry.search("ACME").unwrap().len(), 1);
        assert!(registry.search("nothing").unwrap().is_empty());
        let stored = registry.get_search("DEMO42_10").unwrap().unwrap();
        assert_eq!(stored.snapshot["header"]["well_name"], "Pad 7");
    }
}
