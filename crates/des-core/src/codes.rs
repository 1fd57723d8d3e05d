//! Logging codes, event codes and the event type catalog.
//!
//! The numeric values are part of the device wire contract:
//! `0..=8` are lifecycle codes, `1000..=1009` alarms and `2000..` free-form
//! annotations. A device reports its lifecycle phase as a [`LoggingCode`]
//! inside every state snapshot, and the same numbers are reused as event
//! codes for the matching audit entries.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Lifecycle event codes.
pub mod event_codes {
    pub const DES_REG_REQ: i32 = 0;
    pub const DES_REGISTERED: i32 = 1;
    pub const JOB_ENDED: i32 = 2;
    pub const JOB_OFFLINE_END: i32 = 3;
    pub const JOB_END_REQ: i32 = 4;
    pub const JOB_START_REQ: i32 = 5;
    pub const JOB_OFFLINE_START: i32 = 6;
    pub const JOB_STARTED: i32 = 7;
    pub const GPS_ACQUIRED: i32 = 8;

    pub const ALARM_BATT_HIGH_AMP: i32 = 1000;
    pub const ALARM_BATT_LOW_VOLT: i32 = 1001;
    pub const ALARM_MOT_HIGH_VOLT: i32 = 1002;
    pub const ALARM_MOT_LOW_VOLT: i32 = 1003;
    pub const ALARM_HIGH_PRESS: i32 = 1004;
    pub const ALARM_LOW_PRESS: i32 = 1005;
    pub const ALARM_HIGH_FLOW: i32 = 1006;
    pub const ALARM_LOW_FLOW: i32 = 1007;
    pub const ALARM_PRESS_STABLE: i32 = 1008;
    pub const ALARM_FLOW_STABLE: i32 = 1009;

    pub const NOTE_COMMENT: i32 = 2000;
    pub const NOTE_OPERATOR_ACTION: i32 = 2001;
    pub const NOTE_REPORT: i32 = 2002;
}

/// Band an event code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBand {
    Lifecycle,
    Alarm,
    Annotation,
    Unknown,
}

impl EventBand {
    pub fn of(code: i32) -> Self {
        match code {
            0..=8 => Self::Lifecycle,
            1000..=1009 => Self::Alarm,
            c if c >= 2000 => Self::Annotation,
            _ => Self::Unknown,
        }
    }
}

/// Routing phase derived from a logging code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// No job open; records route to the command archive.
    Idle,
    /// A start was requested and the device has not confirmed yet.
    StartRequested,
    /// A job is open; records tagged with its name route to the job store.
    Logging,
    /// An end was requested; the job stays open until confirmed.
    EndRequested,
}

impl JobPhase {
    /// Whether records tagged with the active job name go to the job store.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Logging | Self::EndRequested)
    }
}

/// Device-reported lifecycle code.
///
/// Serialized as its integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum LoggingCode {
    RegistrationRequested,
    Registered,
    JobEnded,
    JobOfflineEnd,
    JobEndRequested,
    JobStartRequested,
    JobOfflineStart,
    JobStarted,
}

impl LoggingCode {
    pub const ALL: &'static [LoggingCode] = &[
        LoggingCode::RegistrationRequested,
        LoggingCode::Registered,
        LoggingCode::JobEnded,
        LoggingCode::JobOfflineEnd,
        LoggingCode::JobEndRequested,
        LoggingCode::JobStartRequested,
        LoggingCode::JobOfflineStart,
        LoggingCode::JobStarted,
    ];

    pub fn code(&self) -> i32 {
        match self {
            Self::RegistrationRequested => event_codes::DES_REG_REQ,
            Self::Registered => event_codes::DES_REGISTERED,
            Self::JobEnded => event_codes::JOB_ENDED,
            Self::JobOfflineEnd => event_codes::JOB_OFFLINE_END,
            Self::JobEndRequested => event_codes::JOB_END_REQ,
            Self::JobStartRequested => event_codes::JOB_START_REQ,
            Self::JobOfflineStart => event_codes::JOB_OFFLINE_START,
            Self::JobStarted => event_codes::JOB_STARTED,
        }
    }

    pub fn phase(&self) -> JobPhase {
        match self {
            Self::RegistrationRequested
            | Self::Registered
            | Self::JobEnded
            | Self::JobOfflineEnd => JobPhase::Idle,
            Self::JobStartRequested => JobPhase::StartRequested,
            Self::JobOfflineStart | Self::JobStarted => JobPhase::Logging,
            Self::JobEndRequested => JobPhase::EndRequested,
        }
    }
}

impl Default for LoggingCode {
    fn default() -> Self {
        Self::Registered
    }
}

impl TryFrom<i32> for LoggingCode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        LoggingCode::ALL
            .iter()
            .copied()
            .find(|c| c.code() == value)
            .ok_or_else(|| Error::Validation(format!("unknown logging code: {}", value)))
    }
}

impl From<LoggingCode> for i32 {
    fn from(code: LoggingCode) -> Self {
        code.code()
    }
}

impl fmt::Display for LoggingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", EventTypeCatalog::standard().name(self.code()), self.code())
    }
}

/// One row of the `event_types` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub code: i32,
    pub name: String,
}

/// Static code to display-name lookup.
#[derive(Debug, Clone)]
pub struct EventTypeCatalog {
    entries: &'static [(i32, &'static str)],
}

const STANDARD_EVENT_TYPES: &[(i32, &str)] = &[
    (event_codes::DES_REG_REQ, "DES REGISTRATION REQUEST"),
    (event_codes::DES_REGISTERED, "DES REGISTRATION COMPLETE"),
    (event_codes::JOB_ENDED, "JOB ENDED"),
    (event_codes::JOB_OFFLINE_END, "JOB ENDED OFFLINE"),
    (event_codes::JOB_END_REQ, "JOB END REQUEST"),
    (event_codes::JOB_START_REQ, "JOB START REQUEST"),
    (event_codes::JOB_OFFLINE_START, "JOB STARTED OFFLINE"),
    (event_codes::JOB_STARTED, "JOB STARTED"),
    (event_codes::GPS_ACQUIRED, "GPS ACQUIRED"),
    (event_codes::ALARM_BATT_HIGH_AMP, "ALARM: BATTERY HIGH CURRENT"),
    (event_codes::ALARM_BATT_LOW_VOLT, "ALARM: BATTERY LOW VOLTAGE"),
    (event_codes::ALARM_MOT_HIGH_VOLT, "ALARM: MOTOR HIGH VOLTAGE"),
    (event_codes::ALARM_MOT_LOW_VOLT, "ALARM: MOTOR LOW VOLTAGE"),
    (event_codes::ALARM_HIGH_PRESS, "ALARM: HIGH PRESSURE"),
    (event_codes::ALARM_LOW_PRESS, "ALARM: LOW PRESSURE"),
    (event_codes::ALARM_HIGH_FLOW, "ALARM: HIGH FLOW"),
    (event_codes::ALARM_LOW_FLOW, "ALARM: LOW FLOW"),
    (event_codes::ALARM_PRESS_STABLE, "SHUT-IN PRESSURE STABILIZED"),
    (event_codes::ALARM_FLOW_STABLE, "FLOW STABILIZED"),
    (event_codes::NOTE_COMMENT, "COMMENT"),
    (event_codes::NOTE_OPERATOR_ACTION, "OPERATOR ACTION"),
    (event_codes::NOTE_REPORT, "REPORT NOTE"),
];

impl EventTypeCatalog {
    pub fn standard() -> Self {
        Self {
            entries: STANDARD_EVENT_TYPES,
        }
    }

    /// Display name for a code; unlisted annotation codes share a generic name.
    pub fn name(&self, code: i32) -> &'static str {
        match self.entries.iter().find(|(c, _)| *c == code) {
            Some((_, name)) => name,
            None if EventBand::of(code) == EventBand::Annotation => "ANNOTATION",
            None => "UNKNOWN EVENT",
        }
    }

    pub fn contains(&self, code: i32) -> bool {
        self.entries.iter().any(|(c, _)| *c == code)
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.entries
            .iter()
            .map(|(code, name)| EventType {
                code: *code,
                name: (*name).to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EventTypeCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_code_wire_values() {
        for code in LoggingCode::ALL {
            let n: i32 = (*code).into();
            assert_eq!(LoggingCode::try_from(n).unwrap(), *code);
        }
        assert!(LoggingCode::try_from(8).is_err());
        assert!(LoggingCode::try_from(-1).is_err());
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(LoggingCode::Registered.phase(), JobPhase::Idle);
        assert_eq!(LoggingCode::JobOfflineEnd.phase(), JobPhase::Idle);
        assert_eq!(LoggingCode::JobStartRequested.phase(), JobPhase::StartRequested);
        assert_eq!(LoggingCode::JobStarted.phase(), JobPhase::Logging);
        assert_eq!(LoggingCode::JobOfflineStart.phase(), JobPhase::Logging);
        assert!(LoggingCode::JobEndRequested.phase().is_active());
        assert!(!LoggingCode::JobStartRequested.phase().is_active());
    }

    #[test]
    fn test_serde_as_integer() {
        let json = serde_json::to_string(&LoggingCode::JobStarted).unwrap();
        assert_eq!(json, "7");
        let code: LoggingCode = serde_json::from_str("2").unwrap();
        assert_eq!(code, LoggingCode::JobEnded);
        assert!(serde_json::from_str::<LoggingCode>("42").is_err());
    }

    #[test]
    fn test_catalog_bands() {
        let catalog = EventTypeCatalog::standard();
        assert_eq!(catalog.name(event_codes::JOB_STARTED), "JOB STARTED");
        assert_eq!(catalog.name(2999), "ANNOTATION");
        assert_eq!(catalog.name(500), "UNKNOWN EVENT");
        assert_eq!(EventBand::of(1004), EventBand::Alarm);
        assert_eq!(EventBand::of(8), EventBand::Lifecycle);
        assert_eq!(catalog.event_types().len(), catalog.len());
    }
}
