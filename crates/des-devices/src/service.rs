//! DES Service - control plane entry points
//!
//! This service ties the pieces together:
//! - Device registration and (re)connection
//! - User requests (start/end jobs, settings updates), gated by role
//! - Inbound signal handling through the ordered dispatcher
//! - Liveness supervisors, one per connected device
//! - Status queries and the live feed

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use des_core::codes::event_codes;
use des_core::config::DesConfig;
use des_core::feed::{LiveFeed, LiveReceiver};
use des_core::models::{
    archive_name, now_millis, AdminSettings, ConfigSettings, DeviceRecord, EventRecord, HeaderInfo,
    JobRecord, StateSnapshot,
};
use des_storage::{JobSearchRecord, RegistryStore, StoreHandle, StoreProvisioner};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::alarms::{AlarmEvaluator, ThresholdAlarms};
use crate::error::{DesError, Result};
use crate::jobs::{persist, JobEngine, TransitionRows};
use crate::liveness::{LivenessSettings, LivenessSupervisor, PingRegistry};
use crate::messages::{JobBundle, SampleEnvelope, WireRecord};
use crate::pubsub::{Dispatcher, MessageHandler};
use crate::registry::{CacheSeed, DeviceCacheEntry, DeviceLink, DeviceRegistry};
use crate::service_types::{DeviceStatus, Registration, RequestSource};
use crate::topics::{is_valid_serial, DeviceTopics, Direction, Field, TopicPath};
use crate::transport::{InboundMessage, Transport};

struct ServiceInner {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    db: Arc<RegistryStore>,
    provisioner: StoreProvisioner,
    engine: JobEngine,
    dispatcher: Arc<Dispatcher>,
    liveness: LivenessSettings,
    server_pings: Arc<PingRegistry>,
    device_pings: Arc<PingRegistry>,
    supervisors: DashMap<String, CancellationToken>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Handle to the running control plane. Cheap to clone.
#[derive(Clone)]
pub struct DesService {
    inner: Arc<ServiceInner>,
}

// Dispatcher callback. Weak so the dispatcher does not keep the service alive.
struct SignalHandler {
    inner: Weak<ServiceInner>,
}

#[async_trait]
impl MessageHandler for SignalHandler {
    async fn handle(&self, message: InboundMessage) {
        if let Some(inner) = self.inner.upgrade() {
            DesService { inner }.handle_signal(message).await;
        }
    }
}

impl DesService {
    /// Open the registry database and start dispatching `inbound`.
    pub fn start(
        config: &DesConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundMessage>,
    ) -> Result<Self> {
        Self::with_alarms(config, transport, inbound, Arc::new(ThresholdAlarms::new()))
    }

    pub fn with_alarms(
        config: &DesConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundMessage>,
        alarms: Arc<dyn AlarmEvaluator>,
    ) -> Result<Self> {
        let db = Arc::new(RegistryStore::open_in(&config.data_dir)?);
        let registry = Arc::new(DeviceRegistry::new(LiveFeed::new()));
        let provisioner = StoreProvisioner::new(&config.data_dir);
        let engine = JobEngine::new(registry.clone(), db.clone(), provisioner.clone(), alarms);
        let cancel = CancellationToken::new();

        let inner = Arc::new_cyclic(|weak: &Weak<ServiceInner>| {
            let handler = Arc::new(SignalHandler { inner: weak.clone() });
            ServiceInner {
                transport,
                registry,
                db,
                provisioner,
                engine,
                dispatcher: Dispatcher::new(handler, cancel.child_token()),
                liveness: LivenessSettings::from_config(&config.liveness),
                server_pings: Arc::new(PingRegistry::new()),
                device_pings: Arc::new(PingRegistry::new()),
                supervisors: DashMap::new(),
                tracker: TaskTracker::new(),
                cancel,
            }
        });
        inner.dispatcher.start(inbound);

        info!(
            data_dir = %config.data_dir.display(),
            transport = %inner.transport.name(),
            "DES service started"
        );
        Ok(Self { inner })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn registry_db(&self) -> &Arc<RegistryStore> {
        &self.inner.db
    }

    pub fn engine(&self) -> &JobEngine {
        &self.inner.engine
    }

    pub fn server_pings(&self) -> &Arc<PingRegistry> {
        &self.inner.server_pings
    }

    pub fn device_pings(&self) -> &Arc<PingRegistry> {
        &self.inner.device_pings
    }

    pub fn feed(&self) -> &LiveFeed {
        self.inner.registry.feed()
    }

    // ========== Registration & connection ==========

    /// Register a device, or reconnect it if it is already registered.
    ///
    /// Creates the device record, its command archive job and store, and
    /// seeds the archive with default settings and a registration event.
    pub async fn register_device(
        &self,
        source: &RequestSource,
        registration: Registration,
    ) -> Result<DeviceRecord> {
        source.require_admin()?;
        let serial = registration.serial.trim().to_string();
        if !is_valid_serial(&serial) {
            return Err(DesError::InvalidRequest(format!("invalid serial: {:?}", serial)));
        }
        if registration.class.is_empty() || registration.version.is_empty() {
            return Err(DesError::InvalidRequest(
                "class and version are required".to_string(),
            ));
        }

        if let Some(device) = self.inner.db.get_device(&serial)? {
            info!(serial = %serial, "Device already registered");
            if !self.inner.registry.contains(&serial) {
                self.connect_device(device.clone()).await?;
            }
            return Ok(device);
        }

        let t = now_millis();
        let src = source.source.at(t);
        let device = DeviceRecord {
            serial: serial.clone(),
            class: registration.class,
            version: registration.version,
            reg: src.clone(),
        };
        self.inner.db.insert_device(&device).map_err(|e| match e {
            des_storage::Error::AlreadyExists(s) => DesError::AlreadyRegistered(s),
            e => e.into(),
        })?;

        let archive_job = JobRecord::archive(&device);
        self.inner.db.put_job(&archive_job)?;
        let archive = self.inner.provisioner.connect(&archive_job.name)?;

        let rows = TransitionRows {
            admin: AdminSettings::defaults(&serial, src.clone()),
            header: HeaderInfo::defaults(&serial, src.clone()),
            config: ConfigSettings::defaults(&serial, src.clone()),
            event: EventRecord::new(
                &serial,
                &archive_job.name,
                event_codes::DES_REGISTERED,
                src.clone(),
                "",
            ),
            state: StateSnapshot::defaults(&serial, src),
        };
        persist(&archive, rows.admin.clone()).await?;
        persist(&archive, rows.header.clone()).await?;
        persist(&archive, rows.config.clone()).await?;
        persist(&archive, rows.event.clone()).await?;
        persist(&archive, rows.state.clone()).await?;

        let search = JobSearchRecord::build(
            &archive_job,
            &rows.admin,
            &rows.header,
            &rows.config,
            &rows.state,
            t,
        );
        if let Err(e) = self.inner.db.put_search(&search) {
            warn!(serial = %serial, error = %e, "Failed to write archive search record");
        }

        info!(serial = %serial, class = %device.class, version = %device.version, "Device registered");
        self.attach(device.clone(), archive, None).await?;
        Ok(device)
    }

    /// Connect every registered device. Returns how many connected.
    pub async fn connect_all(&self) -> Result<usize> {
        let devices = self.inner.db.list_devices()?;
        let total = devices.len();
        let mut connected = 0;
        for device in devices {
            let serial = device.serial.clone();
            match self.connect_device(device).await {
                Ok(()) => connected += 1,
                Err(e) => error!(serial = %serial, error = %e, "Failed to connect device"),
            }
        }
        info!(connected, total, "Devices connected");
        Ok(connected)
    }

    /// Open a registered device's stores, load its cache, subscribe its
    /// signals and start its liveness supervisor. No-op when connected.
    pub async fn connect_device(&self, device: DeviceRecord) -> Result<()> {
        if self.inner.registry.contains(&device.serial) {
            debug!(serial = %device.serial, "Device already connected");
            return Ok(());
        }
        let archive = self.inner.provisioner.connect(&archive_name(&device.serial))?;
        let job = match self.inner.db.open_job(&device.serial)? {
            Some(job) => match self.inner.provisioner.connect(&job.name) {
                Ok(store) => {
                    info!(serial = %device.serial, job = %job.name, "Reopened active job");
                    Some(store)
                }
                Err(e) => {
                    error!(
                        serial = %device.serial,
                        job = %job.name,
                        error = %e,
                        "Active job store unavailable; logging to the command archive"
                    );
                    None
                }
            },
            None => None,
        };
        self.attach(device, archive, job).await
    }

    async fn attach(
        &self,
        device: DeviceRecord,
        archive: Arc<StoreHandle>,
        job: Option<Arc<StoreHandle>>,
    ) -> Result<()> {
        let serial = device.serial.clone();
        let current = job.clone().unwrap_or_else(|| archive.clone());
        let src = device.reg.clone();
        let seed = CacheSeed {
            admin: load_latest(&current, &archive, || AdminSettings::defaults(&serial, src.clone())),
            state: load_latest(&current, &archive, || StateSnapshot::defaults(&serial, src.clone())),
            header: load_latest(&current, &archive, || HeaderInfo::defaults(&serial, src.clone())),
            config: load_latest(&current, &archive, || ConfigSettings::defaults(&serial, src.clone())),
            event: load_latest(&current, &archive, || {
                EventRecord::new(
                    &serial,
                    &archive_name(&serial),
                    event_codes::DES_REGISTERED,
                    src.clone(),
                    "",
                )
            }),
        };

        let topics = DeviceTopics::for_device(&device);
        let filter = topics.sig_filter();
        let liveness_topic = topics.liveness();
        let link = DeviceLink::new(topics, self.inner.transport.clone());
        let entry = Arc::new(DeviceCacheEntry::new(device, link, seed, archive, job));
        self.inner.registry.write(entry);

        if let Err(e) = self.inner.transport.subscribe(&filter).await {
            // The transport resubscribes known filters on reconnect.
            warn!(serial = %serial, filter = %filter, error = %e, "Subscribe failed");
        }

        let token = self.inner.cancel.child_token();
        if let Some(previous) = self.inner.supervisors.insert(serial.clone(), token.clone()) {
            previous.cancel();
        }
        let supervisor = LivenessSupervisor::new(
            serial.clone(),
            liveness_topic,
            self.inner.transport.clone(),
            self.inner.server_pings.clone(),
            self.inner.device_pings.clone(),
            self.inner.liveness,
            token,
        );
        self.inner.tracker.spawn(supervisor.run());

        info!(serial = %serial, filter = %filter, "Device connected");
        Ok(())
    }

    /// Stop a device's supervisor, unsubscribe it and close its stores.
    pub async fn disconnect_device(&self, serial: &str) -> Result<()> {
        if let Some((_, token)) = self.inner.supervisors.remove(serial) {
            token.cancel();
        }
        let entry = self.inner.registry.require(serial)?;
        {
            // Let an in-flight transition finish first.
            let _transition = entry.lock_transition().await;
            self.inner.registry.remove(serial);
        }

        let filter = entry.topics().sig_filter();
        if let Err(e) = self.inner.transport.unsubscribe(&filter).await {
            warn!(serial = %serial, error = %e, "Unsubscribe failed");
        }
        self.inner.dispatcher.retire(entry.topics().prefix());

        if let Some(job) = entry.take_job() {
            job.disconnect().await;
        }
        entry.archive().disconnect().await;
        self.inner.device_pings.remove(serial);
        info!(serial = %serial, "Device disconnected");
        Ok(())
    }

    /// Disconnect every device and join every supervised task.
    pub async fn shutdown(&self) {
        for serial in self.inner.registry.serials() {
            if let Err(e) = self.disconnect_device(&serial).await {
                warn!(serial = %serial, error = %e, "Disconnect failed during shutdown");
            }
        }
        self.inner.cancel.cancel();
        self.inner.dispatcher.shutdown().await;
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        if let Err(e) = self.inner.transport.disconnect().await {
            debug!(error = %e, "Transport disconnect failed");
        }
        info!("DES service stopped");
    }

    // ========== Requests ==========

    pub async fn start_job_request(&self, source: &RequestSource, serial: &str) -> Result<()> {
        source.require_admin()?;
        let entry = self.inner.registry.require(serial)?;
        self.inner.engine.start_request(&entry, &source.source).await
    }

    pub async fn end_job_request(&self, source: &RequestSource, serial: &str) -> Result<()> {
        source.require_admin()?;
        let entry = self.inner.registry.require(serial)?;
        self.inner.engine.end_request(&entry, &source.source).await
    }

    pub async fn set_admin_request(
        &self,
        source: &RequestSource,
        serial: &str,
        admin: AdminSettings,
    ) -> Result<AdminSettings> {
        source.require_admin()?;
        let entry = self.inner.registry.require(serial)?;
        self.inner.engine.set_admin(&entry, &source.source, admin).await
    }

    pub async fn set_header_request(
        &self,
        source: &RequestSource,
        serial: &str,
        header: HeaderInfo,
    ) -> Result<HeaderInfo> {
        source.require_admin()?;
        let entry = self.inner.registry.require(serial)?;
        self.inner.engine.set_header(&entry, &source.source, header).await
    }

    pub async fn set_config_request(
        &self,
        source: &RequestSource,
        serial: &str,
        config: ConfigSettings,
    ) -> Result<ConfigSettings> {
        source.require_admin()?;
        let entry = self.inner.registry.require(serial)?;
        self.inner.engine.set_config(&entry, &source.source, config).await
    }

    pub async fn set_event_request(
        &self,
        source: &RequestSource,
        serial: &str,
        event: EventRecord,
    ) -> Result<EventRecord> {
        source.require_admin()?;
        let entry = self.inner.registry.require(serial)?;
        self.inner.engine.add_event(&entry, &source.source, event).await
    }

    // ========== Queries ==========

    pub fn get_device_status(&self, serial: &str) -> Result<DeviceStatus> {
        let entry = self.inner.registry.require(serial)?;
        let state = entry.state();
        Ok(DeviceStatus {
            device: entry.device().clone(),
            admin: (*entry.admin()).clone(),
            header: (*entry.header()).clone(),
            config: (*entry.config()).clone(),
            event: (*entry.event()).clone(),
            sample: entry.sample().map(|s| (*s).clone()),
            phase: state.logging.phase(),
            job_name: entry.active_job_name(),
            store_name: entry.current_store().name().to_string(),
            server_ping: self.inner.server_pings.last(serial).map(|m| m.time),
            device_ping: self.inner.device_pings.last(serial).map(|m| m.time),
            device_stale: self
                .inner
                .device_pings
                .is_stale(serial, self.inner.liveness.device_stale_after()),
            state: (*state).clone(),
        })
    }

    /// Events of the store current writes go to, oldest first.
    pub fn get_active_job_events(&self, serial: &str) -> Result<Vec<EventRecord>> {
        let entry = self.inner.registry.require(serial)?;
        Ok(entry.current_store().all::<EventRecord>()?)
    }

    pub fn subscribe_live(&self) -> LiveReceiver {
        self.feed().subscribe()
    }

    pub fn subscribe_device_live(&self, serial: &str) -> LiveReceiver {
        self.feed().subscribe_device(serial)
    }

    // ========== Signals ==========

    /// Handle one inbound message. Malformed payloads are logged and dropped.
    pub async fn handle_signal(&self, message: InboundMessage) {
        let Some(path) = TopicPath::parse(&message.topic) else {
            debug!(topic = %message.topic, "Ignoring foreign topic");
            return;
        };
        if path.direction != Direction::Sig {
            return;
        }
        let Some(entry) = self.inner.registry.read(path.serial) else {
            debug!(topic = %message.topic, "Signal for unconnected device");
            return;
        };
        if let Err(e) = self.route_signal(&entry, path.field, &message.payload).await {
            warn!(topic = %message.topic, error = %e, "Signal dropped");
        }
    }

    async fn route_signal(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        field: Field,
        payload: &[u8],
    ) -> Result<()> {
        let engine = &self.inner.engine;
        match field {
            Field::Start => engine.confirm_start(entry, JobBundle::from_wire(payload)?).await,
            Field::End => engine.confirm_end(entry, JobBundle::from_wire(payload)?).await,
            Field::State => {
                engine
                    .route_state(entry, StateSnapshot::from_wire(payload)?)
                    .await?;
                Ok(())
            }
            Field::Sample => {
                let envelope = SampleEnvelope::from_bytes(payload)?;
                let samples = envelope.unpack()?;
                engine
                    .route_samples(entry, &envelope.job_name, samples)
                    .await?;
                Ok(())
            }
            Field::DiagSample => {
                let samples = SampleEnvelope::from_bytes(payload)?.unpack()?;
                let written = engine.record_diag_samples(entry, samples).await;
                debug!(serial = %entry.serial(), written, "Diagnostic samples recorded");
                Ok(())
            }
            Field::Event => {
                engine
                    .route_event(entry, EventRecord::from_wire(payload)?)
                    .await?;
                Ok(())
            }
            Field::Admin => engine.record_admin(entry, AdminSettings::from_wire(payload)?).await,
            Field::Header => engine.record_header(entry, HeaderInfo::from_wire(payload)?).await,
            Field::Config => engine.record_config(entry, ConfigSettings::from_wire(payload)?).await,
            Field::Ping => {
                self.inner.device_pings.mark(entry.serial());
                Ok(())
            }
            Field::Report => {
                debug!(serial = %entry.serial(), "Report signal ignored");
                Ok(())
            }
        }
    }
}

/// Latest row from the current store, then the archive, then `default`.
fn load_latest<R: des_storage::StoreRecord>(
    current: &StoreHandle,
    archive: &StoreHandle,
    default: impl FnOnce() -> R,
) -> R {
    match current.last::<R>() {
        Ok(record) => record,
        Err(_) if current.name() != archive.name() => {
            crate::jobs::latest_or(archive, default)
        }
        Err(e) => {
            if !e.is_not_found() {
                warn!(store = %current.name(), error = %e, "Failed to load latest row");
            }
            default()
        }
    }
}
