//! Device Registry.
//!
//! Connected devices keyed by serial. Each cached field of a
//! [`DeviceCacheEntry`] is its own atomically swapped cell, so concurrent
//! single-field writers (a state signal and a config request, say) can never
//! overwrite each other's update. Every field write is published on the
//! [`LiveFeed`].

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use des_core::codes::JobPhase;
use des_core::feed::{LiveFeed, LiveRecord};
use des_core::models::{
    archive_name, AdminSettings, ConfigSettings, DeviceRecord, EventRecord, HeaderInfo,
    SampleRecord, StateSnapshot,
};
use des_storage::StoreHandle;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{DesError, Result};
use crate::messages::WireRecord;
use crate::topics::{DeviceTopics, Field};
use crate::transport::Transport;

/// A device's binding to the pub/sub transport.
pub struct DeviceLink {
    topics: DeviceTopics,
    transport: Arc<dyn Transport>,
}

impl DeviceLink {
    pub fn new(topics: DeviceTopics, transport: Arc<dyn Transport>) -> Self {
        Self { topics, transport }
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Publish a record's wire view on `cmd/<field>`.
    pub async fn command<R: WireRecord>(&self, field: Field, record: &R) -> Result<()> {
        self.command_raw(field, record.to_wire_bytes()?).await
    }

    pub async fn command_raw(&self, field: Field, payload: Vec<u8>) -> Result<()> {
        let topic = self.topics.cmd(field);
        self.transport.publish(&topic, payload).await?;
        debug!(topic = %topic, "Command published");
        Ok(())
    }
}

/// Latest known values and open handles of one connected device.
pub struct DeviceCacheEntry {
    device: DeviceRecord,
    link: DeviceLink,

    admin: ArcSwap<AdminSettings>,
    state: ArcSwap<StateSnapshot>,
    header: ArcSwap<HeaderInfo>,
    config: ArcSwap<ConfigSettings>,
    event: ArcSwap<EventRecord>,
    sample: ArcSwapOption<SampleRecord>,

    archive: Arc<StoreHandle>,
    job: ArcSwapOption<StoreHandle>,

    // Serializes job transitions and signal routing for this device.
    transition: Mutex<()>,
}

/// Initial field values for a new entry.
pub struct CacheSeed {
    pub admin: AdminSettings,
    pub state: StateSnapshot,
    pub header: HeaderInfo,
    pub config: ConfigSettings,
    pub event: EventRecord,
}

impl DeviceCacheEntry {
    pub fn new(
        device: DeviceRecord,
        link: DeviceLink,
        seed: CacheSeed,
        archive: Arc<StoreHandle>,
        job: Option<Arc<StoreHandle>>,
    ) -> Self {
        Self {
            device,
            link,
            admin: ArcSwap::from_pointee(seed.admin),
            state: ArcSwap::from_pointee(seed.state),
            header: ArcSwap::from_pointee(seed.header),
            config: ArcSwap::from_pointee(seed.config),
            event: ArcSwap::from_pointee(seed.event),
            sample: ArcSwapOption::from(None),
            archive,
            job: ArcSwapOption::from(job),
            transition: Mutex::new(()),
        }
    }

    pub fn serial(&self) -> &str {
        &self.device.serial
    }

    pub fn device(&self) -> &DeviceRecord {
        &self.device
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn topics(&self) -> &DeviceTopics {
        self.link.topics()
    }

    pub fn archive_name(&self) -> String {
        archive_name(&self.device.serial)
    }

    pub fn admin(&self) -> Arc<AdminSettings> {
        self.admin.load_full()
    }

    pub fn state(&self) -> Arc<StateSnapshot> {
        self.state.load_full()
    }

    pub fn header(&self) -> Arc<HeaderInfo> {
        self.header.load_full()
    }

    pub fn config(&self) -> Arc<ConfigSettings> {
        self.config.load_full()
    }

    pub fn event(&self) -> Arc<EventRecord> {
        self.event.load_full()
    }

    pub fn sample(&self) -> Option<Arc<SampleRecord>> {
        self.sample.load_full()
    }

    /// Routing phase of the cached state.
    pub fn phase(&self) -> JobPhase {
        self.state.load().logging.phase()
    }

    /// Name of the job records are routed to: the cached state's job while
    /// a job is active, the archive otherwise.
    pub fn active_job_name(&self) -> String {
        let state = self.state.load();
        if state.logging.phase().is_active() {
            state.job_name.clone()
        } else {
            self.archive_name()
        }
    }

    pub fn archive(&self) -> Arc<StoreHandle> {
        Arc::clone(&self.archive)
    }

    pub fn job(&self) -> Option<Arc<StoreHandle>> {
        self.job.load_full()
    }

    /// Store that current writes go to: the open job, or the archive.
    pub fn current_store(&self) -> Arc<StoreHandle> {
        self.job.load_full().unwrap_or_else(|| self.archive())
    }

    pub(crate) fn set_job(&self, job: Option<Arc<StoreHandle>>) {
        self.job.store(job);
    }

    pub(crate) fn take_job(&self) -> Option<Arc<StoreHandle>> {
        self.job.swap(None)
    }

    /// Hold the device's transition lock.
    pub async fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().await
    }
}

/// Registry of connected devices.
pub struct DeviceRegistry {
    entries: DashMap<String, Arc<DeviceCacheEntry>>,
    feed: LiveFeed,
}

impl DeviceRegistry {
    pub fn new(feed: LiveFeed) -> Self {
        Self {
            entries: DashMap::new(),
            feed,
        }
    }

    pub fn feed(&self) -> &LiveFeed {
        &self.feed
    }

    pub fn read(&self, serial: &str) -> Option<Arc<DeviceCacheEntry>> {
        self.entries.get(serial).map(|e| Arc::clone(e.value()))
    }

    pub fn require(&self, serial: &str) -> Result<Arc<DeviceCacheEntry>> {
        self.read(serial)
            .ok_or_else(|| DesError::DeviceNotFound(serial.to_string()))
    }

    /// Insert or replace an entry.
    pub fn write(&self, entry: Arc<DeviceCacheEntry>) {
        let serial = entry.serial().to_string();
        if self.entries.insert(serial.clone(), entry).is_some() {
            debug!(serial = %serial, "Registry entry replaced");
        } else {
            info!(serial = %serial, "Device added to registry");
        }
    }

    pub fn remove(&self, serial: &str) -> Option<Arc<DeviceCacheEntry>> {
        let removed = self.entries.remove(serial).map(|(_, e)| e);
        if removed.is_some() {
            info!(serial = %serial, "Device removed from registry");
        }
        removed
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.entries.contains_key(serial)
    }

    pub fn serials(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn read_latest_admin(&self, serial: &str) -> Result<Arc<AdminSettings>> {
        Ok(self.require(serial)?.admin())
    }

    pub fn read_latest_state(&self, serial: &str) -> Result<Arc<StateSnapshot>> {
        Ok(self.require(serial)?.state())
    }

    pub fn read_latest_header(&self, serial: &str) -> Result<Arc<HeaderInfo>> {
        Ok(self.require(serial)?.header())
    }

    pub fn read_latest_config(&self, serial: &str) -> Result<Arc<ConfigSettings>> {
        Ok(self.require(serial)?.config())
    }

    pub fn read_latest_event(&self, serial: &str) -> Result<Arc<EventRecord>> {
        Ok(self.require(serial)?.event())
    }

    pub fn read_latest_sample(&self, serial: &str) -> Result<Option<Arc<SampleRecord>>> {
        Ok(self.require(serial)?.sample())
    }

    pub fn write_latest_admin(&self, serial: &str, admin: AdminSettings) -> Result<()> {
        let entry = self.require(serial)?;
        entry.admin.store(Arc::new(admin.clone()));
        self.feed.publish(serial, LiveRecord::Admin(admin));
        Ok(())
    }

    pub fn write_latest_state(&self, serial: &str, state: StateSnapshot) -> Result<()> {
        let entry = self.require(serial)?;
        entry.state.store(Arc::new(state.clone()));
        self.feed.publish(serial, LiveRecord::State(state));
        Ok(())
    }

    pub fn write_latest_header(&self, serial: &str, header: HeaderInfo) -> Result<()> {
        let entry = self.require(serial)?;
        entry.header.store(Arc::new(header.clone()));
        self.feed.publish(serial, LiveRecord::Header(header));
        Ok(())
    }

    pub fn write_latest_config(&self, serial: &str, config: ConfigSettings) -> Result<()> {
        let entry = self.require(serial)?;
        entry.config.store(Arc::new(config.clone()));
        self.feed.publish(serial, LiveRecord::Config(config));
        Ok(())
    }

    pub fn write_latest_event(&self, serial: &str, event: EventRecord) -> Result<()> {
        let entry = self.require(serial)?;
        entry.event.store(Arc::new(event.clone()));
        self.feed.publish(serial, LiveRecord::Event(event));
        Ok(())
    }

    pub fn write_latest_sample(&self, serial: &str, sample: SampleRecord) -> Result<()> {
        let entry = self.require(serial)?;
        entry.sample.store(Some(Arc::new(sample.clone())));
        self.feed.publish(serial, LiveRecord::Sample(sample));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use des_core::models::Source;
    use tokio::sync::mpsc;

    fn entry(dir: &std::path::Path, serial: &str) -> Arc<DeviceCacheEntry> {
        let device = DeviceRecord {
            serial: serial.to_string(),
            class: "001".into(),
            version: "001".into(),
            reg: Source::server(1),
        };
        let (tx, _rx) = mpsc::channel(1);
        let link = DeviceLink::new(
            DeviceTopics::for_device(&device),
            Arc::new(MemoryTransport::new(tx)),
        );
        let src = Source::server(1);
        let seed = CacheSeed {
            admin: AdminSettings::defaults(serial, src.clone()),
            state: StateSnapshot::defaults(serial, src.clone()),
            header: HeaderInfo::defaults(serial, src.clone()),
            config: ConfigSettings::defaults(serial, src.clone()),
            event: EventRecord::new(serial, &archive_name(serial), 1, src, ""),
        };
        let archive = StoreHandle::open(archive_name(serial), dir.join("a.redb")).unwrap();
        Arc::new(DeviceCacheEntry::new(device, link, seed, archive, None))
    }

    #[test]
    fn test_read_write_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(LiveFeed::new());
        registry.write(entry(dir.path(), "DEMO42"));

        assert!(registry.contains("DEMO42"));
        assert_eq!(registry.read_latest_state("DEMO42").unwrap().serial, "DEMO42");
        assert!(registry.read_latest_sample("DEMO42").unwrap().is_none());
        assert!(matches!(
            registry.read_latest_admin("NOPE"),
            Err(DesError::DeviceNotFound(_))
        ));

        assert!(registry.remove("DEMO42").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_current_store_follows_job() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry(dir.path(), "DEMO42");
        assert_eq!(entry.current_store().name(), "DEMO42_CMDARCHIVE");
        assert_eq!(entry.active_job_name(), "DEMO42_CMDARCHIVE");

        let job = StoreHandle::open("DEMO42_10", dir.path().join("j.redb")).unwrap();
        entry.set_job(Some(job));
        assert_eq!(entry.current_store().name(), "DEMO42_10");
        assert_eq!(entry.take_job().unwrap().name(), "DEMO42_10");
        assert_eq!(entry.current_store().name(), "DEMO42_CMDARCHIVE");
    }

    #[tokio::test]
    async fn test_writes_reach_feed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(LiveFeed::new());
        registry.write(entry(dir.path(), "DEMO42"));
        let mut rx = registry.feed().subscribe_device("DEMO42");

        let mut config = (*registry.read_latest_config("DEMO42").unwrap()).clone();
        config.op_sample_ms = 250;
        registry.write_latest_config("DEMO42", config).unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.record.kind(), "config");
    }
}
