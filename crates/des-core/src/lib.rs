//! DES core types.
//!
//! Shared building blocks for the DES control plane:
//! - **codes**: logging codes, event codes and the event type catalog
//! - **models**: versioned settings/state snapshots, jobs and samples
//! - **codec**: the fixed-width telemetry frame and its URL-safe text form
//! - **feed**: broadcast of latest-record updates
//! - **config**: TOML + environment configuration

pub mod codec;
pub mod codes;
pub mod config;
pub mod error;
pub mod feed;
pub mod models;

pub use codec::CodecError;
pub use codes::{event_codes, EventBand, EventType, EventTypeCatalog, JobPhase, LoggingCode};
pub use config::DesConfig;
pub use error::{Error, Result};
pub use feed::{LiveFeed, LiveReceiver, LiveRecord, LiveUpdate};
pub use models::{
    archive_name, is_archive_name, job_name, now_millis, AdminSettings, ConfigSettings,
    DeviceRecord, EventRecord, HeaderInfo, JobRecord, SampleRecord, Source, StateSnapshot,
    ValveMode,
};
