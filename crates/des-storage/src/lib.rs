//! DES storage.
//!
//! - [`StoreHandle`]: one redb database per command archive or job, with a
//!   pending-write barrier for safe disconnects
//! - [`StoreProvisioner`]: name-derived, create-or-detect provisioning
//! - [`RegistryStore`]: devices, jobs and job search summaries

pub mod error;
pub mod pending;
pub mod provision;
pub mod registry_db;
pub mod store;

pub use error::{Error, Result};
pub use pending::{PendingGuard, PendingOps};
pub use provision::{Provisioned, StoreProvisioner};
pub use registry_db::{JobSearchRecord, RegistryStore, REGISTRY_FILE};
pub use store::{tables, RowKey, StoreHandle, StoreRecord};
