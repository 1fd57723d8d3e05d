//! Wire payloads.
//!
//! Admin, config, header, state and event records travel as JSON with the
//! internal `id` and `user_id` fields removed. Samples travel as
//! [`SampleEnvelope`]: the job tag plus the codec's URL-safe text form.

use des_core::codec;
use des_core::models::{
    AdminSettings, ConfigSettings, EventRecord, HeaderInfo, SampleRecord, StateSnapshot,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DesError, Result};

/// Fields never sent to a device.
const INTERNAL_FIELDS: &[&str] = &["id", "user_id"];

/// A record with a filtered wire view.
pub trait WireRecord: Serialize + DeserializeOwned {
    fn to_wire(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            for field in INTERNAL_FIELDS {
                obj.remove(*field);
            }
        }
        Ok(value)
    }

    fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_wire()?)?)
    }

    fn from_wire(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| DesError::Protocol(e.to_string()))
    }
}

impl WireRecord for AdminSettings {}
impl WireRecord for StateSnapshot {}
impl WireRecord for HeaderInfo {}
impl WireRecord for ConfigSettings {}
impl WireRecord for EventRecord {}

/// Sample telemetry: `{ "job_name": ..., "data": <base64url frames> }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEnvelope {
    pub job_name: String,
    pub data: String,
}

impl SampleEnvelope {
    /// Pack samples under one job tag.
    pub fn pack(job_name: impl Into<String>, samples: &[SampleRecord]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * codec::FRAME_LEN);
        for sample in samples {
            bytes.extend_from_slice(&codec::encode(sample));
        }
        Self {
            job_name: job_name.into(),
            data: codec::to_text(&bytes),
        }
    }

    /// Decode the frames, tagging each sample with the envelope's job name.
    pub fn unpack(&self) -> Result<Vec<SampleRecord>> {
        let mut samples = codec::decode_text(&self.data)?;
        for sample in &mut samples {
            sample.job_name = self.job_name.clone();
        }
        Ok(samples)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| DesError::Protocol(e.to_string()))
    }
}

/// Start/end request and confirmation bundle.
///
/// The server publishes the full bundle on `cmd/start` and `cmd/end`; a
/// device's confirmation must carry its state and may omit the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBundle {
    pub state: StateSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventRecord>,
}

impl JobBundle {
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        let mut obj = serde_json::Map::new();
        obj.insert("state".into(), self.state.to_wire()?);
        if let Some(admin) = &self.admin {
            obj.insert("admin".into(), admin.to_wire()?);
        }
        if let Some(header) = &self.header {
            obj.insert("header".into(), header.to_wire()?);
        }
        if let Some(config) = &self.config {
            obj.insert("config".into(), config.to_wire()?);
        }
        if let Some(event) = &self.event {
            obj.insert("event".into(), event.to_wire()?);
        }
        Ok(serde_json::to_vec(&obj)?)
    }

    pub fn from_wire(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| DesError::Protocol(e.to_string()))
    }
}

/// Liveness message on the `des/` namespace and device `sig/ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    pub serial: String,
    pub time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use des_core::models::Source;

    #[test]
    fn test_wire_view_drops_internal_ids() {
        let mut admin = AdminSettings::defaults("DEMO42", Source::new(1, "addr", "user-7", "app"));
        admin.id = 42;
        let wire = admin.to_wire().unwrap();
        assert!(wire.get("id").is_none());
        assert!(wire.get("user_id").is_none());
        assert_eq!(wire["serial"], "DEMO42");
        assert_eq!(wire["addr"], "addr");

        let back = AdminSettings::from_wire(&admin.to_wire_bytes().unwrap()).unwrap();
        assert_eq!(back.id, 0);
        assert_eq!(back.source.user_id, "");
        assert_eq!(back.op_port, admin.op_port);
    }

    #[test]
    fn test_sample_envelope() {
        let samples = vec![
            SampleRecord {
                time: 10,
                press: 1.5,
                ..Default::default()
            },
            SampleRecord {
                time: 20,
                press: 2.5,
                ..Default::default()
            },
        ];
        let envelope = SampleEnvelope::pack("DEMO42_1700000000000", &samples);
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["job_name"], "DEMO42_1700000000000");
        assert!(json["data"].is_string());

        let unpacked = SampleEnvelope::from_bytes(&envelope.to_bytes().unwrap())
            .unwrap()
            .unpack()
            .unwrap();
        assert_eq!(unpacked.len(), 2);
        assert!(unpacked.iter().all(|s| s.job_name == "DEMO42_1700000000000"));
    }

    #[test]
    fn test_malformed_payloads_are_protocol_errors() {
        assert!(matches!(
            SampleEnvelope::from_bytes(b"{not json"),
            Err(DesError::Protocol(_))
        ));
        let envelope = SampleEnvelope {
            job_name: "x".into(),
            data: "AAAA".into(),
        };
        assert!(matches!(envelope.unpack(), Err(DesError::Protocol(_))));
        assert!(matches!(
            JobBundle::from_wire(br#"{"admin": null}"#),
            Err(DesError::Protocol(_))
        ));
    }

    #[test]
    fn test_bundle_state_only() {
        let state = StateSnapshot::defaults("DEMO42", Source::server(5));
        let bundle = JobBundle {
            state,
            admin: None,
            header: None,
            config: None,
            event: None,
        };
        let back = JobBundle::from_wire(&bundle.to_wire_bytes().unwrap()).unwrap();
        assert_eq!(back.state.serial, "DEMO42");
        assert!(back.admin.is_none());
    }
}
