//! Store provisioning.
//!
//! One database file per job, named after the job in lower case:
//! `<data_dir>/<job name>.redb`. The command archive is provisioned the same
//! way under `<serial>_CMDARCHIVE`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use des_core::codes::EventTypeCatalog;
use tracing::{info, warn};

use crate::store::StoreHandle;
use crate::{Error, Result};

const STORE_EXT: &str = "redb";

/// Outcome of [`StoreProvisioner::create`].
#[derive(Debug)]
pub enum Provisioned {
    /// A fresh store with its schema and event types in place.
    Created(Arc<StoreHandle>),
    /// A store of that name was already on disk and was left untouched.
    AlreadyExists(PathBuf),
}

#[derive(Debug, Clone)]
pub struct StoreProvisioner {
    data_dir: PathBuf,
    catalog: EventTypeCatalog,
}

impl StoreProvisioner {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            catalog: EventTypeCatalog::standard(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// File name for a store: the job name lower-cased.
    pub fn file_name(name: &str) -> Result<String> {
        if name.is_empty()
            || name
                .chars()
                .any(|c| c == '/' || c == '\\' || c == '.' || c.is_control())
        {
            return Err(Error::InvalidInput(format!("invalid store name: {:?}", name)));
        }
        Ok(format!("{}.{}", name.to_lowercase(), STORE_EXT))
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        Ok(self.data_dir.join(Self::file_name(name)?))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.exists()).unwrap_or(false)
    }

    /// Provision a new job store.
    ///
    /// Never reopens an existing file: a store left behind by an interrupted
    /// transition is reported as [`Provisioned::AlreadyExists`] so the caller
    /// can fall back to the archive.
    pub fn create(&self, name: &str) -> Result<Provisioned> {
        let path = self.path_for(name)?;
        if path.exists() {
            warn!(store = %name, path = %path.display(), "Store already exists");
            return Ok(Provisioned::AlreadyExists(path));
        }
        std::fs::create_dir_all(&self.data_dir)?;
        let handle = StoreHandle::open(name, path)?;
        self.prepare(&handle);
        info!(store = %name, "Store provisioned");
        Ok(Provisioned::Created(handle))
    }

    /// Open a store, creating it if missing. Used for archives and for
    /// reopening a job that is still open after a restart.
    pub fn connect(&self, name: &str) -> Result<Arc<StoreHandle>> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.data_dir)?;
        let fresh = !path.exists();
        let handle = StoreHandle::open(name, path)?;
        if fresh {
            self.prepare(&handle);
        } else if let Err(e) = handle.init_schema() {
            warn!(store = %name, error = %e, "Failed to verify schema");
        }
        Ok(handle)
    }

    // Schema and catalog failures are logged; the store stays usable.
    fn prepare(&self, handle: &StoreHandle) {
        if let Err(e) = handle.init_schema() {
            warn!(store = %handle.name(), error = %e, "Failed to create schema");
        }
        match handle.seed_event_types(&self.catalog) {
            Ok(n) if n < self.catalog.len() => warn!(
                store = %handle.name(),
                seeded = n,
                expected = self.catalog.len(),
                "Event types partially seeded"
            ),
            Ok(_) => {}
            Err(e) => warn!(store = %handle.name(), error = %e, "Failed to seed event types"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_is_lower_cased() {
        assert_eq!(
            StoreProvisioner::file_name("DEMO42_CMDARCHIVE").unwrap(),
            "demo42_cmdarchive.redb"
        );
        assert!(StoreProvisioner::file_name("../etc").is_err());
        assert!(StoreProvisioner::file_name("").is_err());
    }

    #[test]
    fn test_create_detects_existing() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = StoreProvisioner::new(dir.path());

        let first = provisioner.create("DEMO42_1700000000000").unwrap();
        let Provisioned::Created(handle) = first else {
            panic!("expected a new store");
        };
        assert_eq!(
            handle.event_types().unwrap().len(),
            EventTypeCatalog::standard().len()
        );
        assert!(provisioner.exists("demo42_1700000000000"));

        assert!(matches!(
            provisioner.create("DEMO42_1700000000000").unwrap(),
            Provisioned::AlreadyExists(_)
        ));
    }
}
