//! Device-confirmed job starts and ends.
//!
//! Callers hold the device's transition lock.

use std::sync::Arc;

use des_core::codes::LoggingCode;
use des_core::models::{
    is_archive_name, job_name, AdminSettings, ConfigSettings, EventRecord, HeaderInfo, JobRecord,
    SampleRecord, StateSnapshot,
};
use des_storage::{JobSearchRecord, Provisioned, StoreHandle, StoreRecord};
use tracing::{debug, error, info, warn};

use super::{reported_time, settle, JobEngine, TransitionRows};
use crate::error::{DesError, Result};
use crate::messages::JobBundle;
use crate::registry::DeviceCacheEntry;

impl JobEngine {
    /// Open the job a device confirmed it started.
    ///
    /// Seed rows are written and committed before the cached state flips to
    /// logging, so no signal tagged with the new job can reach the old store
    /// after this returns.
    pub(crate) async fn confirm_start_locked(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        bundle: JobBundle,
        offline: bool,
    ) -> Result<()> {
        let serial = entry.serial().to_string();
        let t = reported_time(bundle.state.source.time);
        let name = if bundle.state.job_name.is_empty() {
            job_name(&serial, t)
        } else {
            bundle.state.job_name.clone()
        };
        if is_archive_name(&name) {
            return Err(DesError::Protocol(format!(
                "start confirmation for {} names the command archive",
                serial
            )));
        }

        let state = entry.state();
        if state.logging.phase().is_active() && state.job_name == name {
            debug!(serial = %serial, job = %name, "Job already open; refreshing");
            return self.refresh_job(entry, bundle, &name);
        }
        if self.is_ended_job(&name) {
            warn!(
                serial = %serial,
                job = %name,
                "Start confirmation for ended job; writing to the command archive"
            );
            let archive = entry.archive();
            let src = bundle.state.source.at(t);
            let code = if offline {
                LoggingCode::JobOfflineStart
            } else {
                LoggingCode::JobStarted
            };
            let event = EventRecord::new(&serial, &name, code.code(), src.clone(), "");
            let state = StateSnapshot {
                id: 0,
                source: src,
                serial: serial.clone(),
                job_name: name,
                ..bundle.state
            };
            settle(archive.name(), archive.create_in_background(event)).await;
            settle(archive.name(), archive.create_in_background(state)).await;
            return Ok(());
        }
        if state.logging.phase().is_active() {
            // A new job while another is open: the device moved on without us.
            warn!(
                serial = %serial,
                open = %state.job_name,
                confirmed = %name,
                "Closing open job before starting the confirmed one"
            );
            self.retire_job(entry, &state.job_name, t).await;
        }

        let code = if offline {
            LoggingCode::JobOfflineStart
        } else {
            LoggingCode::JobStarted
        };
        let src = bundle.state.source.at(t);
        let rows = TransitionRows {
            admin: AdminSettings {
                id: 0,
                source: src.clone(),
                serial: serial.clone(),
                job_name: name.clone(),
                ..bundle.admin.unwrap_or_else(|| (*entry.admin()).clone())
            },
            header: HeaderInfo {
                id: 0,
                source: src.clone(),
                serial: serial.clone(),
                job_name: name.clone(),
                ..bundle.header.unwrap_or_else(|| (*entry.header()).clone())
            },
            config: ConfigSettings {
                id: 0,
                source: src.clone(),
                serial: serial.clone(),
                job_name: name.clone(),
                ..bundle.config.unwrap_or_else(|| (*entry.config()).clone())
            },
            event: EventRecord::new(&serial, &name, code.code(), src.clone(), ""),
            state: StateSnapshot {
                id: 0,
                source: src.clone(),
                serial: serial.clone(),
                logging: code,
                job_name: name.clone(),
                ..bundle.state
            },
        };

        let (latitude, longitude) = rows.header.coordinates();
        let job = JobRecord {
            name: name.clone(),
            serial: serial.clone(),
            reg: src,
            start: t,
            end: 0,
            latitude,
            longitude,
        };
        self.db.put_job(&job)?;

        let store = match self.provisioner.create(&name) {
            Ok(Provisioned::Created(store)) => Some(store),
            Ok(Provisioned::AlreadyExists(path)) => {
                warn!(
                    serial = %serial,
                    job = %name,
                    path = %path.display(),
                    "Job store already exists; logging to the command archive"
                );
                None
            }
            Err(e) => {
                error!(
                    serial = %serial,
                    job = %name,
                    error = %e,
                    "Job store unavailable; logging to the command archive"
                );
                None
            }
        };
        let target = store.clone().unwrap_or_else(|| entry.archive());

        let (rows, failed) = rows.write_to(&target).await;
        if failed > 0 {
            warn!(serial = %serial, job = %name, failed, "Some job seed rows were not written");
        }
        target.drain().await;
        entry.set_job(store);

        // Flip the gate.
        self.cache_rows(&serial, rows.clone())?;

        self.put_search(&job, &rows);
        if target.name() != entry.archive().name() {
            let archive_event = EventRecord {
                id: 0,
                ..rows.event.clone()
            };
            let archive = entry.archive();
            settle(archive.name(), archive.create_in_background(archive_event)).await;
        }

        info!(
            serial = %serial,
            job = %name,
            offline,
            store = %target.name(),
            "Job started"
        );
        Ok(())
    }

    /// Close the active job the device confirmed it ended, and return the
    /// device to its command archive.
    pub(crate) async fn confirm_end_locked(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        bundle: JobBundle,
        offline: bool,
    ) -> Result<()> {
        let serial = entry.serial().to_string();
        let cached = entry.state();
        if !cached.logging.phase().is_active() {
            debug!(serial = %serial, "End confirmation with no active job");
            return Ok(());
        }

        let name = cached.job_name.clone();
        let t = reported_time(bundle.state.source.time);
        let src = bundle.state.source.at(t);
        let code = if offline {
            LoggingCode::JobOfflineEnd
        } else {
            LoggingCode::JobEnded
        };

        // Final rows, read before the job store closes.
        let current = entry.current_store();
        let admin: AdminSettings = latest_or(&current, || (*entry.admin()).clone());
        let header: HeaderInfo = latest_or(&current, || (*entry.header()).clone());
        let config: ConfigSettings = latest_or(&current, || (*entry.config()).clone());
        let last_sample = current.last::<SampleRecord>().ok().map(|s| s.time);

        let end_state = StateSnapshot {
            id: 0,
            source: src.clone(),
            serial: serial.clone(),
            logging: code,
            job_name: name.clone(),
            ..bundle.state
        };
        let end_event = EventRecord::new(&serial, &name, code.code(), src.clone(), "");

        if let Some(job) = entry.take_job() {
            settle(job.name(), job.create_in_background(end_event.clone())).await;
            settle(job.name(), job.create_in_background(end_state.clone())).await;
            job.drain().await;
            job.disconnect().await;
        }

        let ended = match self.db.end_job(&name, t) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(serial = %serial, job = %name, error = %e, "Failed to record job end");
                None
            }
        };
        let archive_job = match self.db.get_job(&entry.archive_name()) {
            Ok(Some(job)) => job,
            _ => JobRecord::archive(entry.device()),
        };
        if let Err(e) = self.db.put_job(&archive_job) {
            warn!(serial = %serial, error = %e, "Failed to reopen command archive job");
        }
        if let Some(ended) = &ended {
            let snapshot = TransitionRows {
                admin,
                header,
                config,
                event: end_event.clone(),
                state: end_state.clone(),
            };
            self.put_search(ended, &snapshot);
        }

        let archive = entry.archive();
        let archive_name = entry.archive_name();
        let archive_event = EventRecord {
            id: 0,
            job_name: archive_name.clone(),
            ..end_event
        };
        let archive_state = StateSnapshot {
            id: 0,
            job_name: archive_name,
            ..end_state
        };
        let archive_event = settle(archive.name(), archive.create_in_background(archive_event.clone()))
            .await
            .unwrap_or(archive_event);
        let archive_state = settle(archive.name(), archive.create_in_background(archive_state.clone()))
            .await
            .unwrap_or(archive_state);
        archive.drain().await;

        // Between jobs the cache mirrors the archive.
        let rows = TransitionRows {
            admin: latest_or(&archive, || (*entry.admin()).clone()),
            header: latest_or(&archive, || (*entry.header()).clone()),
            config: latest_or(&archive, || (*entry.config()).clone()),
            event: archive_event,
            state: archive_state,
        };
        self.cache_rows(&serial, rows)?;
        self.alarms.reset(&serial);

        info!(
            serial = %serial,
            job = %name,
            offline,
            last_sample = ?last_sample,
            "Job ended"
        );
        Ok(())
    }

    // Re-confirmation of the open job: cache what the device reported.
    fn refresh_job(&self, entry: &Arc<DeviceCacheEntry>, bundle: JobBundle, name: &str) -> Result<()> {
        let serial = entry.serial();
        if let Some(admin) = bundle.admin {
            self.registry.write_latest_admin(
                serial,
                AdminSettings {
                    job_name: name.to_string(),
                    ..admin
                },
            )?;
        }
        if let Some(header) = bundle.header {
            self.registry.write_latest_header(
                serial,
                HeaderInfo {
                    job_name: name.to_string(),
                    ..header
                },
            )?;
        }
        if let Some(config) = bundle.config {
            self.registry.write_latest_config(
                serial,
                ConfigSettings {
                    job_name: name.to_string(),
                    ..config
                },
            )?;
        }
        // Keep the cached phase; a stale idle report must not close the gate.
        let logging = entry.state().logging;
        self.registry.write_latest_state(
            serial,
            StateSnapshot {
                logging,
                job_name: name.to_string(),
                ..bundle.state
            },
        )?;
        Ok(())
    }

    /// Close an open job without the archive round trip.
    async fn retire_job(&self, entry: &Arc<DeviceCacheEntry>, name: &str, end: i64) {
        if let Some(job) = entry.take_job() {
            job.disconnect().await;
        }
        if let Err(e) = self.db.end_job(name, end) {
            warn!(serial = %entry.serial(), job = %name, error = %e, "Failed to record job end");
        }
    }

    fn put_search(&self, job: &JobRecord, rows: &TransitionRows) {
        let record = JobSearchRecord::build(
            job,
            &rows.admin,
            &rows.header,
            &rows.config,
            &rows.state,
            rows.state.source.time,
        );
        if let Err(e) = self.db.put_search(&record) {
            warn!(job = %job.name, error = %e, "Failed to update job search record");
        }
    }
}

/// Latest row of a store, or `fallback` when it has none.
pub(crate) fn latest_or<R: StoreRecord>(store: &StoreHandle, fallback: impl FnOnce() -> R) -> R {
    match store.last::<R>() {
        Ok(record) => record,
        Err(e) if e.is_not_found() => fallback(),
        Err(e) => {
            warn!(store = %store.name(), error = %e, "Failed to read latest row");
            fallback()
        }
    }
}
