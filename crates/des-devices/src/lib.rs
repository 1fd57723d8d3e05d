//! DES device and job management.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT transport via rumqttc |
//!
//! ## Architecture
//!
//! - **DeviceRegistry**: latest settings, state and store handles of every
//!   connected device, one atomically swapped cell per field
//! - **JobEngine**: start/end requests, device confirmations, offline
//!   reconciliation and signal routing
//! - **LivenessSupervisor**: per-device server ping loop and device ping
//!   staleness tracking
//! - **Transport**: pub/sub seam (MQTT or in-memory), fed through the
//!   ordered per-topic `Dispatcher`
//! - **DesService**: the entry points used by the HTTP layer and the binary

pub mod alarms;
pub mod error;
pub mod jobs;
pub mod liveness;
pub mod memory;
pub mod messages;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod pubsub;
pub mod registry;
pub mod service;
pub mod service_types;
pub mod topics;
pub mod transport;

pub use alarms::{AlarmEvaluator, NoAlarms, RaisedAlarm, ThresholdAlarms};
pub use error::{DesError, Result};
pub use jobs::{JobEngine, Route};
pub use liveness::{LivenessSettings, LivenessSupervisor, PingMark, PingRegistry};
pub use memory::MemoryTransport;
pub use messages::{JobBundle, PingMessage, SampleEnvelope, WireRecord};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use pubsub::{Dispatcher, MessageHandler};
pub use registry::{CacheSeed, DeviceCacheEntry, DeviceLink, DeviceRegistry};
pub use service::DesService;
pub use service_types::{DeviceStatus, Registration, RequestSource, Role};
pub use topics::{DeviceTopics, Direction, Field, TopicPath};
pub use transport::{InboundMessage, Transport, TransportError};
