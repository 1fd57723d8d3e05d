//! User-initiated requests.
//!
//! A request succeeds once it is logged and published; the device confirms
//! asynchronously on its `sig/` topics.

use std::sync::Arc;

use des_core::codes::{event_codes, EventBand, EventTypeCatalog, LoggingCode};
use des_core::models::{
    now_millis, AdminSettings, ConfigSettings, EventRecord, HeaderInfo, Source, StateSnapshot,
};
use des_storage::StoreHandle;
use tracing::info;

use super::{persist, JobEngine, TransitionRows};
use crate::error::{DesError, Result};
use crate::messages::JobBundle;
use crate::registry::DeviceCacheEntry;
use crate::topics::Field;

impl JobEngine {
    /// Ask the device to start a job.
    ///
    /// The request is persisted to the command archive only; the job store
    /// is created when the device confirms.
    pub async fn start_request(&self, entry: &Arc<DeviceCacheEntry>, source: &Source) -> Result<()> {
        let _transition = entry.lock_transition().await;
        let serial = entry.serial();
        let phase = entry.phase();
        if phase.is_active() {
            return Err(DesError::InvalidState(format!(
                "{} is already logging job {}",
                serial,
                entry.state().job_name
            )));
        }

        let t = now_millis();
        let src = source.at(t);
        let archive_name = entry.archive_name();
        let rows = TransitionRows {
            admin: AdminSettings {
                id: 0,
                source: src.clone(),
                job_name: archive_name.clone(),
                ..(*entry.admin()).clone()
            },
            header: HeaderInfo {
                id: 0,
                source: src.clone(),
                job_name: archive_name.clone(),
                ..(*entry.header()).clone()
            },
            config: ConfigSettings {
                id: 0,
                source: src.clone(),
                job_name: archive_name.clone(),
                ..(*entry.config()).clone()
            },
            event: EventRecord::new(
                serial,
                &archive_name,
                event_codes::JOB_START_REQ,
                src.clone(),
                "",
            ),
            state: StateSnapshot {
                id: 0,
                source: src,
                logging: LoggingCode::JobStartRequested,
                job_name: archive_name,
                ..(*entry.state()).clone()
            },
        };

        let rows = self.persist_rows(&entry.archive(), rows).await?;
        entry
            .link()
            .command_raw(Field::Start, bundle(&rows).to_wire_bytes()?)
            .await?;
        self.cache_rows(serial, rows)?;
        info!(serial = %serial, "Job start requested");
        Ok(())
    }

    /// Ask the device to end its job. Logged to the job and the archive.
    pub async fn end_request(&self, entry: &Arc<DeviceCacheEntry>, source: &Source) -> Result<()> {
        let _transition = entry.lock_transition().await;
        let serial = entry.serial();
        if !entry.phase().is_active() {
            return Err(DesError::InvalidState(format!("{} has no active job", serial)));
        }

        let t = now_millis();
        let src = source.at(t);
        let job_name = entry.state().job_name.clone();
        let rows = TransitionRows {
            admin: AdminSettings {
                id: 0,
                source: src.clone(),
                job_name: job_name.clone(),
                ..(*entry.admin()).clone()
            },
            header: HeaderInfo {
                id: 0,
                source: src.clone(),
                job_name: job_name.clone(),
                ..(*entry.header()).clone()
            },
            config: ConfigSettings {
                id: 0,
                source: src.clone(),
                job_name: job_name.clone(),
                ..(*entry.config()).clone()
            },
            event: EventRecord::new(serial, &job_name, event_codes::JOB_END_REQ, src.clone(), ""),
            state: StateSnapshot {
                id: 0,
                source: src,
                logging: LoggingCode::JobEndRequested,
                job_name: job_name.clone(),
                ..(*entry.state()).clone()
            },
        };

        let current = entry.current_store();
        let archive = entry.archive();
        let rows = self.persist_rows(&current, rows).await?;
        if current.name() != archive.name() {
            persist(&archive, EventRecord { id: 0, ..rows.event.clone() }).await?;
            persist(&archive, StateSnapshot { id: 0, ..rows.state.clone() }).await?;
        }

        entry
            .link()
            .command_raw(Field::End, bundle(&rows).to_wire_bytes()?)
            .await?;
        self.cache_rows(serial, rows)?;
        info!(serial = %serial, job = %job_name, "Job end requested");
        Ok(())
    }

    pub async fn set_admin(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        source: &Source,
        admin: AdminSettings,
    ) -> Result<AdminSettings> {
        let _transition = entry.lock_transition().await;
        let admin = AdminSettings {
            id: 0,
            source: source.at(now_millis()),
            serial: entry.serial().to_string(),
            job_name: entry.active_job_name(),
            ..admin
        };
        let admin = persist(&entry.current_store(), admin).await?;
        entry.link().command(Field::Admin, &admin).await?;
        self.registry
            .write_latest_admin(entry.serial(), admin.clone())?;
        Ok(admin)
    }

    pub async fn set_header(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        source: &Source,
        header: HeaderInfo,
    ) -> Result<HeaderInfo> {
        let _transition = entry.lock_transition().await;
        let header = HeaderInfo {
            id: 0,
            source: source.at(now_millis()),
            serial: entry.serial().to_string(),
            job_name: entry.active_job_name(),
            ..header
        };
        let header = persist(&entry.current_store(), header).await?;
        entry.link().command(Field::Header, &header).await?;
        self.registry
            .write_latest_header(entry.serial(), header.clone())?;
        Ok(header)
    }

    pub async fn set_config(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        source: &Source,
        config: ConfigSettings,
    ) -> Result<ConfigSettings> {
        let _transition = entry.lock_transition().await;
        let config = ConfigSettings {
            id: 0,
            source: source.at(now_millis()),
            serial: entry.serial().to_string(),
            job_name: entry.active_job_name(),
            ..config
        };
        let config = persist(&entry.current_store(), config).await?;
        entry.link().command(Field::Config, &config).await?;
        self.registry
            .write_latest_config(entry.serial(), config.clone())?;
        Ok(config)
    }

    /// Log a user event. Lifecycle codes are reserved for transitions.
    pub async fn add_event(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        source: &Source,
        event: EventRecord,
    ) -> Result<EventRecord> {
        let catalog = EventTypeCatalog::standard();
        if !catalog.contains(event.code) {
            return Err(DesError::InvalidRequest(format!("unknown event code {}", event.code)));
        }
        if EventBand::of(event.code) == EventBand::Lifecycle
            && event.code != event_codes::GPS_ACQUIRED
        {
            return Err(DesError::InvalidRequest(format!(
                "event code {} is reserved for job transitions",
                event.code
            )));
        }

        let _transition = entry.lock_transition().await;
        let title = if event.title.is_empty() {
            catalog.name(event.code).to_string()
        } else {
            event.title
        };
        let event = EventRecord {
            id: 0,
            source: source.at(now_millis()),
            serial: entry.serial().to_string(),
            job_name: entry.active_job_name(),
            title,
            ..event
        };
        let event = persist(&entry.current_store(), event).await?;
        entry.link().command(Field::Event, &event).await?;
        self.registry
            .write_latest_event(entry.serial(), event.clone())?;
        Ok(event)
    }

    // Request rows gate the request: any failed write fails it.
    async fn persist_rows(
        &self,
        store: &StoreHandle,
        rows: TransitionRows,
    ) -> Result<TransitionRows> {
        Ok(TransitionRows {
            admin: persist(store, rows.admin).await?,
            header: persist(store, rows.header).await?,
            config: persist(store, rows.config).await?,
            event: persist(store, rows.event).await?,
            state: persist(store, rows.state).await?,
        })
    }
}

fn bundle(rows: &TransitionRows) -> JobBundle {
    JobBundle {
        state: rows.state.clone(),
        admin: Some(rows.admin.clone()),
        header: Some(rows.header.clone()),
        config: Some(rows.config.clone()),
        event: Some(rows.event.clone()),
    }
}
