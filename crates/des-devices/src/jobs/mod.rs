//! Job Lifecycle State Machine.
//!
//! A device is idle (writing to its command archive), start-requested,
//! logging (writing to an open job store) or end-requested. Transitions come
//! from explicit requests and the device's confirmations, or are inferred
//! from telemetry when the device changed jobs on its own:
//!
//! - [`request`]: start/end requests and settings updates from users
//! - [`confirm`]: device-confirmed starts and ends
//! - [`offline`]: starts and ends inferred from signals
//! - [`routing`]: where each inbound sample, event and state is written
//!
//! Every transition and every routing decision for a device runs under the
//! device's transition lock.

mod confirm;
mod offline;
mod request;
mod routing;

use std::sync::Arc;

use des_core::models::{
    now_millis, AdminSettings, ConfigSettings, EventRecord, HeaderInfo, StateSnapshot,
};
use des_storage::{RegistryStore, StoreHandle, StoreProvisioner, StoreRecord};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::alarms::AlarmEvaluator;
use crate::error::Result;
use crate::registry::DeviceRegistry;

pub(crate) use confirm::latest_or;
pub use offline::start_from_name;
pub use routing::Route;

pub struct JobEngine {
    registry: Arc<DeviceRegistry>,
    db: Arc<RegistryStore>,
    provisioner: StoreProvisioner,
    alarms: Arc<dyn AlarmEvaluator>,
}

impl JobEngine {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        db: Arc<RegistryStore>,
        provisioner: StoreProvisioner,
        alarms: Arc<dyn AlarmEvaluator>,
    ) -> Self {
        Self {
            registry,
            db,
            provisioner,
            alarms,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn db(&self) -> &Arc<RegistryStore> {
        &self.db
    }

    pub fn provisioner(&self) -> &StoreProvisioner {
        &self.provisioner
    }
}

/// The rows written together at a transition.
#[derive(Debug, Clone)]
pub(crate) struct TransitionRows {
    pub admin: AdminSettings,
    pub header: HeaderInfo,
    pub config: ConfigSettings,
    pub event: EventRecord,
    pub state: StateSnapshot,
}

impl TransitionRows {
    /// Write every row to `store` and wait for the commits. Failures are
    /// logged; the returned rows carry the ids of the writes that succeeded.
    pub async fn write_to(self, store: &StoreHandle) -> (Self, usize) {
        let name = store.name().to_string();
        let admin = store.create_in_background(self.admin.clone());
        let header = store.create_in_background(self.header.clone());
        let config = store.create_in_background(self.config.clone());
        let event = store.create_in_background(self.event.clone());
        let state = store.create_in_background(self.state.clone());

        let mut failed = 0;
        let mut rows = self;
        match settle(&name, admin).await {
            Some(r) => rows.admin = r,
            None => failed += 1,
        }
        match settle(&name, header).await {
            Some(r) => rows.header = r,
            None => failed += 1,
        }
        match settle(&name, config).await {
            Some(r) => rows.config = r,
            None => failed += 1,
        }
        match settle(&name, event).await {
            Some(r) => rows.event = r,
            None => failed += 1,
        }
        match settle(&name, state).await {
            Some(r) => rows.state = r,
            None => failed += 1,
        }
        (rows, failed)
    }
}

impl JobEngine {
    /// Cache a transition's rows. The state goes last: it is the routing gate.
    pub(crate) fn cache_rows(&self, serial: &str, rows: TransitionRows) -> Result<()> {
        self.registry.write_latest_admin(serial, rows.admin)?;
        self.registry.write_latest_header(serial, rows.header)?;
        self.registry.write_latest_config(serial, rows.config)?;
        self.registry.write_latest_event(serial, rows.event)?;
        self.registry.write_latest_state(serial, rows.state)?;
        Ok(())
    }
}

/// Write on the blocking pool and wait for the commit.
pub(crate) async fn persist<R: StoreRecord>(store: &StoreHandle, record: R) -> Result<R> {
    let written = store
        .create_in_background(record)
        .await
        .map_err(des_storage::Error::from)??;
    Ok(written)
}

/// Await a background write whose failure is logged, not returned.
pub(crate) async fn settle<R>(store: &str, write: JoinHandle<des_storage::Result<R>>) -> Option<R> {
    match write.await {
        Ok(Ok(record)) => Some(record),
        // The writer already logged the store error.
        Ok(Err(_)) => None,
        Err(e) => {
            warn!(store = %store, error = %e, "Write task failed");
            None
        }
    }
}

/// Time carried by a device message, or now when it carries none.
pub(crate) fn reported_time(time: i64) -> i64 {
    if time > 0 {
        time
    } else {
        now_millis()
    }
}
