//! Control-plane records.
//!
//! Admin, config, header, state and event records are versioned snapshots:
//! every write is a new row and the latest row by time is the current value.
//! Each snapshot carries its own [`Source`] provenance.

use serde::{Deserialize, Serialize};

use crate::codes::{EventTypeCatalog, LoggingCode};
use crate::config::defaults;

/// Suffix of the never-ending command archive job.
pub const CMDARCHIVE_SUFFIX: &str = "CMDARCHIVE";

/// Name of a device's command archive job.
pub fn archive_name(serial: &str) -> String {
    format!("{}_{}", serial, CMDARCHIVE_SUFFIX)
}

/// Name of a job started at `start_millis`.
pub fn job_name(serial: &str, start_millis: i64) -> String {
    format!("{}_{}", serial, start_millis)
}

pub fn is_archive_name(name: &str) -> bool {
    name.ends_with(CMDARCHIVE_SUFFIX)
}

/// Current time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Who wrote a snapshot, from where and when.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Unix millis.
    #[serde(default)]
    pub time: i64,
    /// Originating address (client IP, device serial, or a server tag).
    #[serde(default)]
    pub addr: String,
    /// Registering or requesting user. Dropped on the wire.
    #[serde(default)]
    pub user_id: String,
    /// Originating application.
    #[serde(default)]
    pub app: String,
}

impl Source {
    pub fn new(
        time: i64,
        addr: impl Into<String>,
        user_id: impl Into<String>,
        app: impl Into<String>,
    ) -> Self {
        Self {
            time,
            addr: addr.into(),
            user_id: user_id.into(),
            app: app.into(),
        }
    }

    /// Provenance for records the server synthesizes itself.
    pub fn server(time: i64) -> Self {
        Self::new(time, defaults::SERVER_ADDR, "", defaults::SERVER_APP)
    }

    /// Same origin, restamped at `time`.
    pub fn at(&self, time: i64) -> Self {
        Self {
            time,
            ..self.clone()
        }
    }
}

/// Device identity, created once at registration and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub serial: String,
    /// Hardware class, first topic level.
    pub class: String,
    /// Hardware version, second topic level.
    pub version: String,
    pub reg: Source,
}

/// One logging session, or the device's command archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub serial: String,
    pub reg: Source,
    pub start: i64,
    /// Zero while the job is open. Always zero for the command archive.
    pub end: i64,
    pub latitude: f64,
    pub longitude: f64,
}

impl JobRecord {
    pub fn archive(device: &DeviceRecord) -> Self {
        Self {
            name: archive_name(&device.serial),
            serial: device.serial.clone(),
            reg: device.reg.clone(),
            start: device.reg.time,
            end: 0,
            latitude: defaults::LATITUDE,
            longitude: defaults::LONGITUDE,
        }
    }

    pub fn is_archive(&self) -> bool {
        is_archive_name(&self.name)
    }

    pub fn is_open(&self) -> bool {
        self.end == 0
    }
}

/// Broker endpoints and alarm thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminSettings {
    #[serde(default)]
    pub id: i64,
    #[serde(flatten)]
    pub source: Source,
    pub serial: String,
    #[serde(default)]
    pub job_name: String,

    pub def_host: String,
    pub def_port: u16,
    pub op_host: String,
    pub op_port: u16,

    pub batt_high_amp: f32,
    pub batt_low_volt: f32,
    pub mot_high_volt: f32,
    pub mot_low_volt: f32,
    pub high_press: f32,
    pub low_press: f32,
    pub high_flow: f32,
    pub low_flow: f32,

    /// Max pressure change over the window for shut-in to count as stable.
    pub press_stable_delta: f32,
    pub press_stable_window_ms: i64,
    /// Max flow change over the window for flow to count as stable.
    pub flow_stable_delta: f32,
    pub flow_stable_window_ms: i64,
}

impl AdminSettings {
    pub fn defaults(serial: &str, source: Source) -> Self {
        Self {
            id: 0,
            source,
            serial: serial.to_string(),
            job_name: archive_name(serial),
            def_host: defaults::MQTT_HOST.to_string(),
            def_port: defaults::MQTT_PORT,
            op_host: defaults::MQTT_HOST.to_string(),
            op_port: defaults::MQTT_PORT,
            batt_high_amp: 13.0,
            batt_low_volt: 10.5,
            mot_high_volt: 13.5,
            mot_low_volt: 10.0,
            high_press: 6000.0,
            low_press: 0.0,
            high_flow: 250.0,
            low_flow: 0.0,
            press_stable_delta: 5.0,
            press_stable_window_ms: 600_000,
            flow_stable_delta: 0.5,
            flow_stable_window_ms: 600_000,
        }
    }
}

/// Valve operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ValveMode {
    Vent,
    Build,
    HiFlow,
    LoFlow,
}

impl TryFrom<u8> for ValveMode {
    type Error = crate::error::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Vent),
            1 => Ok(Self::Build),
            2 => Ok(Self::HiFlow),
            3 => Ok(Self::LoFlow),
            _ => Err(crate::error::Error::Validation(format!(
                "unknown valve mode: {}",
                value
            ))),
        }
    }
}

impl From<ValveMode> for u8 {
    fn from(mode: ValveMode) -> Self {
        match mode {
            ValveMode::Vent => 0,
            ValveMode::Build => 1,
            ValveMode::HiFlow => 2,
            ValveMode::LoFlow => 3,
        }
    }
}

/// Operational and diagnostic timing plus valve parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSettings {
    #[serde(default)]
    pub id: i64,
    #[serde(flatten)]
    pub source: Source,
    pub serial: String,
    #[serde(default)]
    pub job_name: String,

    pub op_sample_ms: u32,
    pub op_log_ms: u32,
    pub diag_sample_ms: u32,
    pub diag_log_ms: u32,
    /// Period of the device's own ping signal.
    pub ping_ms: u32,

    pub valve_mode: ValveMode,
    pub valve_target: u16,
    /// Build duration before venting, in seconds.
    pub build_s: u32,
}

impl ConfigSettings {
    pub fn defaults(serial: &str, source: Source) -> Self {
        Self {
            id: 0,
            source,
            serial: serial.to_string(),
            job_name: archive_name(serial),
            op_sample_ms: 1000,
            op_log_ms: 10_000,
            diag_sample_ms: 500,
            diag_log_ms: 1000,
            ping_ms: defaults::DEVICE_PING_MS,
            valve_mode: ValveMode::Vent,
            valve_target: 0,
            build_s: 0,
        }
    }
}

/// Well and location metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(flatten)]
    pub source: Source,
    pub serial: String,
    #[serde(default)]
    pub job_name: String,

    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub supervisor: String,
    #[serde(default)]
    pub contractor: String,
    #[serde(default)]
    pub well_name: String,
    #[serde(default)]
    pub well_location: String,
    #[serde(default)]
    pub well_field: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl HeaderInfo {
    pub fn defaults(serial: &str, source: Source) -> Self {
        Self {
            id: 0,
            source,
            serial: serial.to_string(),
            job_name: archive_name(serial),
            company: String::new(),
            supervisor: String::new(),
            contractor: String::new(),
            well_name: String::new(),
            well_location: String::new(),
            well_field: String::new(),
            latitude: None,
            longitude: None,
        }
    }

    /// Reported coordinates, or the documented defaults when either is absent.
    pub fn coordinates(&self) -> (f64, f64) {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng))
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) =>
            {
                (lat, lng)
            }
            _ => (defaults::LATITUDE, defaults::LONGITUDE),
        }
    }
}

/// Device-reported health, identity and lifecycle phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub id: i64,
    #[serde(flatten)]
    pub source: Source,
    pub serial: String,

    #[serde(default)]
    pub hw_id: String,
    #[serde(default)]
    pub hw_version: String,
    #[serde(default)]
    pub fw_version: String,

    /// Lifecycle phase; gates where samples and events are written.
    pub logging: LoggingCode,
    /// Job the device is currently logging under.
    pub job_name: String,
}

impl StateSnapshot {
    pub fn defaults(serial: &str, source: Source) -> Self {
        Self {
            id: 0,
            source,
            serial: serial.to_string(),
            hw_id: String::new(),
            hw_version: String::new(),
            fw_version: String::new(),
            logging: LoggingCode::Registered,
            job_name: archive_name(serial),
        }
    }
}

/// A coded, human-titled log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(flatten)]
    pub source: Source,
    pub serial: String,
    #[serde(default)]
    pub job_name: String,
    pub code: i32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub msg: String,
}

impl EventRecord {
    /// Event titled from the standard catalog.
    pub fn new(serial: &str, job_name: &str, code: i32, source: Source, msg: impl Into<String>) -> Self {
        Self {
            id: 0,
            source,
            serial: serial.to_string(),
            job_name: job_name.to_string(),
            code,
            title: EventTypeCatalog::standard().name(code).to_string(),
            msg: msg.into(),
        }
    }
}

/// High-rate telemetry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Unix millis.
    pub time: i64,
    pub ch4: f32,
    pub hi_flow: f32,
    pub lo_flow: f32,
    pub press: f32,
    pub bat_amp: f32,
    pub bat_volt: f32,
    pub mot_volt: f32,
    pub vlv_tgt: u16,
    pub vlv_pos: u16,
    /// Job the sample was captured under.
    #[serde(default)]
    pub job_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::event_codes;

    #[test]
    fn test_job_names() {
        assert_eq!(archive_name("DEMO42"), "DEMO42_CMDARCHIVE");
        assert_eq!(job_name("DEMO42", 1_700_000_000_000), "DEMO42_1700000000000");
        assert!(is_archive_name("DEMO42_CMDARCHIVE"));
        assert!(!is_archive_name("DEMO42_1700000000000"));
    }

    #[test]
    fn test_header_coordinates_fallback() {
        let mut header = HeaderInfo::defaults("DEMO42", Source::server(0));
        assert_eq!(header.coordinates(), (defaults::LATITUDE, defaults::LONGITUDE));

        header.latitude = Some(51.05);
        assert_eq!(header.coordinates(), (defaults::LATITUDE, defaults::LONGITUDE));

        header.longitude = Some(-114.07);
        assert_eq!(header.coordinates(), (51.05, -114.07));

        header.latitude = Some(123.0);
        assert_eq!(header.coordinates(), (defaults::LATITUDE, defaults::LONGITUDE));
    }

    #[test]
    fn test_source_flattened() {
        let event = EventRecord::new(
            "DEMO42",
            "DEMO42_CMDARCHIVE",
            event_codes::DES_REGISTERED,
            Source::new(5, "10.0.0.1", "u-1", "web"),
            "",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["time"], 5);
        assert_eq!(json["addr"], "10.0.0.1");
        assert_eq!(json["title"], "DES REGISTRATION COMPLETE");
    }

    #[test]
    fn test_valve_mode_wire() {
        assert_eq!(serde_json::to_string(&ValveMode::HiFlow).unwrap(), "2");
        assert!(serde_json::from_str::<ValveMode>("9").is_err());
    }
}
