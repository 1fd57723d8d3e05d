//! Types for DES service operations

use des_core::codes::JobPhase;
use des_core::models::{
    AdminSettings, ConfigSettings, DeviceRecord, EventRecord, HeaderInfo, SampleRecord, Source,
    StateSnapshot,
};
use serde::{Deserialize, Serialize};

use crate::error::{DesError, Result};

/// Role of the authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Viewer,
}

/// Who is making a request, as established by the excluded auth layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSource {
    pub source: Source,
    pub role: Role,
}

impl RequestSource {
    pub fn new(source: Source, role: Role) -> Self {
        Self { source, role }
    }

    pub fn admin(addr: impl Into<String>, user_id: impl Into<String>, app: impl Into<String>) -> Self {
        Self::new(Source::new(0, addr, user_id, app), Role::Admin)
    }

    pub fn viewer(addr: impl Into<String>, user_id: impl Into<String>, app: impl Into<String>) -> Self {
        Self::new(Source::new(0, addr, user_id, app), Role::Viewer)
    }

    /// Requests that change device state need the admin role.
    pub fn require_admin(&self) -> Result<()> {
        match self.role {
            Role::Admin => Ok(()),
            Role::Viewer => Err(DesError::Unauthorized(format!(
                "user {:?} needs the admin role",
                self.source.user_id
            ))),
        }
    }
}

/// A device registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub serial: String,
    pub class: String,
    pub version: String,
}

/// Snapshot of a connected device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device: DeviceRecord,
    pub admin: AdminSettings,
    pub state: StateSnapshot,
    pub header: HeaderInfo,
    pub config: ConfigSettings,
    pub event: EventRecord,
    pub sample: Option<SampleRecord>,
    pub phase: JobPhase,
    pub job_name: String,
    /// Name of the store current writes go to.
    pub store_name: String,
    /// Unix millis of the server's last liveness ping.
    pub server_ping: Option<i64>,
    /// Unix millis of the device's last ping.
    pub device_ping: Option<i64>,
    pub device_stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_gate() {
        assert!(RequestSource::admin("10.0.0.1", "ops", "web").require_admin().is_ok());
        assert!(matches!(
            RequestSource::viewer("10.0.0.1", "guest", "web").require_admin(),
            Err(DesError::Unauthorized(_))
        ));
    }
}
