//! Registry field isolation and liveness supervision.

use std::sync::Arc;
use std::time::Duration;

use des_core::feed::LiveFeed;
use des_core::models::{
    archive_name, AdminSettings, ConfigSettings, DeviceRecord, EventRecord, HeaderInfo, Source,
    StateSnapshot,
};
use des_devices::{
    CacheSeed, DeviceCacheEntry, DeviceLink, DeviceRegistry, DeviceTopics, LivenessSettings,
    LivenessSupervisor, MemoryTransport, PingMessage, PingRegistry,
};
use des_storage::StoreHandle;
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn registry_with(dir: &std::path::Path, serial: &str) -> DeviceRegistry {
    let device = DeviceRecord {
        serial: serial.to_string(),
        class: "001".to_string(),
        version: "001".to_string(),
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
    let archive = StoreHandle::open(archive_name(serial), dir.join("archive.redb")).unwrap();
    let registry = DeviceRegistry::new(LiveFeed::new());
    registry.write(Arc::new(DeviceCacheEntry::new(
        device, link, seed, archive, None,
    )));
    registry
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn concurrent_field_writes_are_never_lost(
        state_writes in 1u32..200,
        config_writes in 1u32..200,
        header_writes in 1u32..200,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), "DEMO42");

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..state_writes {
                    let mut state = (*registry.read_latest_state("DEMO42").unwrap()).clone();
                    state.fw_version = i.to_string();
                    registry.write_latest_state("DEMO42", state).unwrap();
                }
            });
            s.spawn(|| {
                for i in 0..config_writes {
                    let mut config = (*registry.read_latest_config("DEMO42").unwrap()).clone();
                    config.op_sample_ms = i;
                    registry.write_latest_config("DEMO42", config).unwrap();
                }
            });
            s.spawn(|| {
                for i in 0..header_writes {
                    let mut header = (*registry.read_latest_header("DEMO42").unwrap()).clone();
                    header.well_name = format!("well-{}", i);
                    registry.write_latest_header("DEMO42", header).unwrap();
                }
            });
        });

        let state = registry.read_latest_state("DEMO42").unwrap();
        let config = registry.read_latest_config("DEMO42").unwrap();
        let header = registry.read_latest_header("DEMO42").unwrap();
        prop_assert_eq!(state.fw_version.clone(), (state_writes - 1).to_string());
        prop_assert_eq!(config.op_sample_ms, config_writes - 1);
        prop_assert_eq!(header.well_name.clone(), format!("well-{}", header_writes - 1));
    }
}

#[tokio::test]
async fn test_supervisor_publishes_and_cleans_up() {
    let (tx, _rx) = mpsc::channel(8);
    let transport = MemoryTransport::new(tx);
    let topics = DeviceTopics::new("001", "001", "DEMO42");
    let server_pings = Arc::new(PingRegistry::new());
    let device_pings = Arc::new(PingRegistry::new());
    let cancel = CancellationToken::new();

    let supervisor = LivenessSupervisor::new(
        "DEMO42",
        topics.liveness(),
        Arc::new(transport.clone()),
        server_pings.clone(),
        device_pings.clone(),
        LivenessSettings {
            interval: Duration::from_millis(20),
            device_period: Duration::from_millis(20),
            stale_multiplier: 2,
        },
        cancel.clone(),
    );
    let task = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(server_pings.contains("DEMO42"));
    let pings = transport.published_on(&topics.liveness());
    assert!(pings.len() >= 2);
    let ping: PingMessage = serde_json::from_slice(&pings[0].payload).unwrap();
    assert_eq!(ping.serial, "DEMO42");

    // No device pings arrived since connect.
    assert!(device_pings.is_stale("DEMO42", Duration::from_millis(40)));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert!(!server_pings.contains("DEMO42"));

    let published = transport.published_on(&topics.liveness()).len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.published_on(&topics.liveness()).len(), published);
}

#[tokio::test]
async fn test_cancel_before_first_tick() {
    let (tx, _rx) = mpsc::channel(8);
    let transport = MemoryTransport::new(tx);
    let server_pings = Arc::new(PingRegistry::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    LivenessSupervisor::new(
        "DEMO42",
        "des/001/001/DEMO42/ping",
        Arc::new(transport.clone()),
        server_pings.clone(),
        Arc::new(PingRegistry::new()),
        LivenessSettings {
            interval: Duration::from_secs(60),
            device_period: Duration::from_secs(60),
            stale_multiplier: 3,
        },
        cancel,
    )
    .run()
    .await;

    assert!(transport.published().is_empty());
    assert!(!server_pings.contains("DEMO42"));
}

#[test]
fn test_device_ping_staleness() {
    let pings = PingRegistry::new();
    pings.mark("DEMO42");
    assert!(!pings.is_stale("DEMO42", Duration::from_secs(30)));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(pings.stale(Duration::from_millis(10)), vec!["DEMO42".to_string()]);
}
