//! Signal routing.
//!
//! Every inbound sample, event and state is matched against the cached
//! lifecycle phase before it is written. Divergence between what the device
//! reports and what the cache believes is reconciled through the offline
//! transitions; the device wins.

use std::sync::Arc;

use des_core::codes::{EventTypeCatalog, JobPhase};
use des_core::models::{
    is_archive_name, AdminSettings, ConfigSettings, EventRecord, HeaderInfo, SampleRecord, Source,
    StateSnapshot,
};
use des_storage::StoreHandle;
use tracing::{debug, error, warn};

use super::{reported_time, settle, JobEngine};
use crate::alarms::RaisedAlarm;
use crate::error::Result;
use crate::messages::JobBundle;
use crate::registry::DeviceCacheEntry;
use crate::topics::Field;

/// Where a signal was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The device's command archive.
    Archive,
    /// The active job's store (or the archive standing in for it).
    Job,
}

impl JobEngine {
    /// Device confirmed a start on `sig/start`.
    pub async fn confirm_start(&self, entry: &Arc<DeviceCacheEntry>, bundle: JobBundle) -> Result<()> {
        let _transition = entry.lock_transition().await;
        self.confirm_start_locked(entry, bundle, false).await
    }

    /// Device confirmed an end on `sig/end`.
    pub async fn confirm_end(&self, entry: &Arc<DeviceCacheEntry>, bundle: JobBundle) -> Result<()> {
        let _transition = entry.lock_transition().await;
        self.confirm_end_locked(entry, bundle, false).await
    }

    /// Write a batch of samples sharing one job tag.
    pub async fn route_samples(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        tag: &str,
        samples: Vec<SampleRecord>,
    ) -> Result<Route> {
        let Some(first) = samples.first() else {
            debug!(serial = %entry.serial(), "Empty sample batch");
            return Ok(Route::Archive);
        };
        let _transition = entry.lock_transition().await;
        let route = self.resolve(entry, tag, reported_time(first.time)).await;
        let store = self.store_for(entry, route);

        let writes: Vec<_> = samples
            .iter()
            .cloned()
            .map(|sample| store.create_in_background(sample))
            .collect();

        if route == Route::Job {
            let admin = entry.admin();
            let config = entry.config();
            for sample in &samples {
                for alarm in self
                    .alarms
                    .evaluate(entry.serial(), &admin, &config, sample)
                {
                    self.raise_alarm(entry, &store, tag, sample.time, alarm).await;
                }
            }
        }

        let mut failed = 0;
        for write in writes {
            if settle(store.name(), write).await.is_none() {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(serial = %entry.serial(), store = %store.name(), failed, "Samples not written");
        }
        if let Some(last) = samples.last() {
            self.registry
                .write_latest_sample(entry.serial(), last.clone())?;
        }
        Ok(route)
    }

    /// Diagnostic samples always go to the command archive.
    pub async fn record_diag_samples(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        samples: Vec<SampleRecord>,
    ) -> usize {
        let archive = entry.archive();
        let writes: Vec<_> = samples
            .into_iter()
            .map(|sample| archive.create_in_background(sample))
            .collect();
        let mut written = 0;
        for write in writes {
            if settle(archive.name(), write).await.is_some() {
                written += 1;
            }
        }
        written
    }

    pub async fn route_event(&self, entry: &Arc<DeviceCacheEntry>, event: EventRecord) -> Result<Route> {
        let _transition = entry.lock_transition().await;
        let time = reported_time(event.source.time);
        let route = self.resolve(entry, &event.job_name, time).await;
        let store = self.store_for(entry, route);

        let job_name = if event.job_name.is_empty() {
            entry.archive_name()
        } else {
            event.job_name.clone()
        };
        let title = if event.title.is_empty() {
            EventTypeCatalog::standard().name(event.code).to_string()
        } else {
            event.title.clone()
        };
        let event = EventRecord {
            id: 0,
            source: event.source.at(time),
            serial: entry.serial().to_string(),
            job_name,
            title,
            ..event
        };
        let event = settle(store.name(), store.create_in_background(event.clone()))
            .await
            .unwrap_or(event);
        self.registry.write_latest_event(entry.serial(), event)?;
        Ok(route)
    }

    pub async fn route_state(&self, entry: &Arc<DeviceCacheEntry>, state: StateSnapshot) -> Result<Route> {
        let _transition = entry.lock_transition().await;
        let serial = entry.serial();
        let time = reported_time(state.source.time);
        let cached = entry.state();
        let cached_phase = cached.logging.phase();
        let reported_phase = state.logging.phase();
        let tag = state.job_name.clone();
        let names_job = !tag.is_empty() && !is_archive_name(&tag);

        if cached_phase.is_active() && reported_phase == JobPhase::Idle {
            // Device closed the job while we still had it open.
            if let Err(e) = self.offline_end_locked(entry, time, Some(state)).await {
                error!(serial = %serial, error = %e, "Offline job end failed");
            }
            return Ok(Route::Archive);
        }

        let switched = cached_phase.is_active() && tag != cached.job_name;
        if reported_phase.is_active() && names_job && (switched || !cached_phase.is_active()) {
            if self.is_ended_job(&tag) {
                warn!(serial = %serial, job = %tag, "State for ended job; writing to the command archive");
                let archive = entry.archive();
                settle(archive.name(), archive.create_in_background(StateSnapshot { id: 0, ..state })).await;
                return Ok(Route::Archive);
            }
            if switched {
                // Ended one job and started another between reports.
                if let Err(e) = self.offline_end_locked(entry, time, None).await {
                    error!(serial = %serial, error = %e, "Offline job end failed");
                }
            }
            return match self
                .offline_start_locked(entry, &tag, time, Some(state))
                .await
            {
                Ok(()) => Ok(Route::Job),
                Err(e) => {
                    error!(serial = %serial, job = %tag, error = %e, "Offline job start failed");
                    Ok(Route::Archive)
                }
            };
        }

        // Plain report. The cached phase is kept unless the device's report
        // moves it: a periodic idle report does not cancel a pending start,
        // and a logging report does not clear a pending end.
        let logging = match (cached_phase, reported_phase) {
            // Nothing open to log to.
            (c, r) if r.is_active() && !c.is_active() => cached.logging,
            (JobPhase::StartRequested, JobPhase::Idle) => cached.logging,
            (JobPhase::EndRequested, JobPhase::Logging) => cached.logging,
            (c, r @ (JobPhase::StartRequested | JobPhase::EndRequested)) if c != r => cached.logging,
            _ => state.logging,
        };
        let route = if cached_phase.is_active() {
            Route::Job
        } else {
            Route::Archive
        };
        let store = self.store_for(entry, route);
        let state = StateSnapshot {
            id: 0,
            source: state.source.at(time),
            serial: serial.to_string(),
            logging,
            job_name: entry.active_job_name(),
            ..state
        };
        let state = settle(store.name(), store.create_in_background(state.clone()))
            .await
            .unwrap_or(state);
        self.registry.write_latest_state(serial, state)?;
        Ok(route)
    }

    /// Device-reported admin settings.
    pub async fn record_admin(&self, entry: &Arc<DeviceCacheEntry>, admin: AdminSettings) -> Result<()> {
        let _transition = entry.lock_transition().await;
        let store = entry.current_store();
        let admin = AdminSettings {
            id: 0,
            source: admin.source.at(reported_time(admin.source.time)),
            serial: entry.serial().to_string(),
            job_name: entry.active_job_name(),
            ..admin
        };
        let admin = settle(store.name(), store.create_in_background(admin.clone()))
            .await
            .unwrap_or(admin);
        self.registry.write_latest_admin(entry.serial(), admin)
    }

    pub async fn record_header(&self, entry: &Arc<DeviceCacheEntry>, header: HeaderInfo) -> Result<()> {
        let _transition = entry.lock_transition().await;
        let store = entry.current_store();
        let header = HeaderInfo {
            id: 0,
            source: header.source.at(reported_time(header.source.time)),
            serial: entry.serial().to_string(),
            job_name: entry.active_job_name(),
            ..header
        };
        let header = settle(store.name(), store.create_in_background(header.clone()))
            .await
            .unwrap_or(header);
        self.registry.write_latest_header(entry.serial(), header)
    }

    pub async fn record_config(&self, entry: &Arc<DeviceCacheEntry>, config: ConfigSettings) -> Result<()> {
        let _transition = entry.lock_transition().await;
        let store = entry.current_store();
        let config = ConfigSettings {
            id: 0,
            source: config.source.at(reported_time(config.source.time)),
            serial: entry.serial().to_string(),
            job_name: entry.active_job_name(),
            ..config
        };
        let config = settle(store.name(), store.create_in_background(config.clone()))
            .await
            .unwrap_or(config);
        self.registry.write_latest_config(entry.serial(), config)
    }

    // Decide where a record tagged `tag` goes, running any offline
    // transition the tag implies. Callers hold the transition lock.
    async fn resolve(&self, entry: &Arc<DeviceCacheEntry>, tag: &str, time: i64) -> Route {
        let serial = entry.serial();
        if tag.is_empty() || tag == entry.archive_name() {
            return Route::Archive;
        }
        let state = entry.state();
        let active = state.logging.phase().is_active();
        if active && state.job_name == tag {
            return Route::Job;
        }
        if self.is_ended_job(tag) {
            warn!(serial = %serial, job = %tag, "Late record for ended job; writing to the command archive");
            return Route::Archive;
        }
        if active {
            // Ended one job and started another between polls: end first.
            if let Err(e) = self.offline_end_locked(entry, time, None).await {
                error!(serial = %serial, error = %e, "Offline job end failed");
            }
        }
        match self.offline_start_locked(entry, tag, time, None).await {
            Ok(()) => Route::Job,
            Err(e) => {
                error!(serial = %serial, job = %tag, error = %e, "Offline job start failed");
                Route::Archive
            }
        }
    }

    pub(crate) fn is_ended_job(&self, name: &str) -> bool {
        match self.db.get_job(name) {
            Ok(Some(job)) => !job.is_archive() && !job.is_open(),
            Ok(None) => false,
            Err(e) => {
                warn!(job = %name, error = %e, "Job lookup failed");
                false
            }
        }
    }

    fn store_for(&self, entry: &DeviceCacheEntry, route: Route) -> Arc<StoreHandle> {
        match route {
            Route::Archive => entry.archive(),
            Route::Job => entry.current_store(),
        }
    }

    async fn raise_alarm(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        store: &StoreHandle,
        tag: &str,
        time: i64,
        alarm: RaisedAlarm,
    ) {
        let serial = entry.serial();
        warn!(serial = %serial, job = %tag, code = alarm.code, msg = %alarm.msg, "Alarm raised");
        let event = EventRecord::new(serial, tag, alarm.code, Source::server(time), alarm.msg);
        let event = settle(store.name(), store.create_in_background(event.clone()))
            .await
            .unwrap_or(event);
        if let Err(e) = self.registry.write_latest_event(serial, event.clone()) {
            debug!(serial = %serial, error = %e, "Alarm not cached");
        }
        if let Err(e) = entry.link().command(Field::Event, &event).await {
            warn!(serial = %serial, error = %e, "Alarm publish failed");
        }
    }
}
