//! Topic namespace.
//!
//! ```text
//! <class>/<version>/<serial>/cmd/<field>    server -> device
//! <class>/<version>/<serial>/sig/<field>    device -> server
//! des/<class>/<version>/<serial>/ping       server liveness
//! ```

use std::fmt;
use std::str::FromStr;

use des_core::models::DeviceRecord;

/// Root of the server-internal namespace.
pub const LIVENESS_ROOT: &str = "des";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Server to device requests.
    Cmd,
    /// Device to server confirmations and telemetry.
    Sig,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Cmd => "cmd",
            Direction::Sig => "sig",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Admin,
    State,
    Header,
    Config,
    Event,
    Sample,
    DiagSample,
    Start,
    End,
    Report,
    Ping,
}

impl Field {
    pub const ALL: &'static [Field] = &[
        Field::Admin,
        Field::State,
        Field::Header,
        Field::Config,
        Field::Event,
        Field::Sample,
        Field::DiagSample,
        Field::Start,
        Field::End,
        Field::Report,
        Field::Ping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Admin => "admin",
            Field::State => "state",
            Field::Header => "header",
            Field::Config => "config",
            Field::Event => "event",
            Field::Sample => "sample",
            Field::DiagSample => "diag_sample",
            Field::Start => "start",
            Field::End => "end",
            Field::Report => "report",
            Field::Ping => "ping",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL.iter().copied().find(|f| f.as_str() == s).ok_or(())
    }
}

/// Topic builder for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    prefix: String,
    serial: String,
}

impl DeviceTopics {
    pub fn new(class: &str, version: &str, serial: &str) -> Self {
        Self {
            prefix: format!("{}/{}/{}", class, version, serial),
            serial: serial.to_string(),
        }
    }

    pub fn for_device(device: &DeviceRecord) -> Self {
        Self::new(&device.class, &device.version, &device.serial)
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// `<class>/<version>/<serial>`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn topic(&self, direction: Direction, field: Field) -> String {
        format!("{}/{}/{}", self.prefix, direction.as_str(), field.as_str())
    }

    pub fn cmd(&self, field: Field) -> String {
        self.topic(Direction::Cmd, field)
    }

    pub fn sig(&self, field: Field) -> String {
        self.topic(Direction::Sig, field)
    }

    /// Filter matching every signal topic of the device.
    pub fn sig_filter(&self) -> String {
        format!("{}/{}/+", self.prefix, Direction::Sig.as_str())
    }

    /// Server liveness topic of the device.
    pub fn liveness(&self) -> String {
        format!("{}/{}/{}", LIVENESS_ROOT, self.prefix, Field::Ping.as_str())
    }
}

/// A parsed per-device topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPath<'a> {
    pub class: &'a str,
    pub version: &'a str,
    pub serial: &'a str,
    pub direction: Direction,
    pub field: Field,
}

impl<'a> TopicPath<'a> {
    /// Parse a `cmd` or `sig` topic. Liveness topics and anything with
    /// unknown levels yield `None`.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let mut parts = topic.split('/');
        let class = parts.next()?;
        let version = parts.next()?;
        let serial = parts.next()?;
        let direction = match parts.next()? {
            "cmd" => Direction::Cmd,
            "sig" => Direction::Sig,
            _ => return None,
        };
        let field = parts.next()?.parse().ok()?;
        if parts.next().is_some() || class.is_empty() || version.is_empty() || serial.is_empty() {
            return None;
        }
        if class == LIVENESS_ROOT {
            return None;
        }
        Some(Self {
            class,
            version,
            serial,
            direction,
            field,
        })
    }
}

/// Whether `serial` can be used as a topic level and store name.
pub fn is_valid_serial(serial: &str) -> bool {
    !serial.is_empty()
        && serial
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        let topics = DeviceTopics::new("001", "002", "DEMO42");
        assert_eq!(topics.cmd(Field::Start), "001/002/DEMO42/cmd/start");
        assert_eq!(topics.sig(Field::DiagSample), "001/002/DEMO42/sig/diag_sample");
        assert_eq!(topics.sig_filter(), "001/002/DEMO42/sig/+");
        assert_eq!(topics.liveness(), "des/001/002/DEMO42/ping");
    }

    #[test]
    fn test_parse_round_trip() {
        let topics = DeviceTopics::new("001", "002", "DEMO42");
        for field in Field::ALL {
            let topic = topics.sig(*field);
            let parsed = TopicPath::parse(&topic).unwrap();
            assert_eq!(parsed.serial, "DEMO42");
            assert_eq!(parsed.direction, Direction::Sig);
            assert_eq!(parsed.field, *field);
        }
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        assert!(TopicPath::parse("des/001/002/DEMO42/ping").is_none());
        assert!(TopicPath::parse("001/002/DEMO42/sig/unknown").is_none());
        assert!(TopicPath::parse("001/002/DEMO42/sig").is_none());
        assert!(TopicPath::parse("001/002/DEMO42/sig/state/extra").is_none());
        assert!(TopicPath::parse("001/002/DEMO42/up/state").is_none());
    }

    #[test]
    fn test_serial_validation() {
        assert!(is_valid_serial("DEMO42"));
        assert!(is_valid_serial("des-0001_a"));
        assert!(!is_valid_serial(""));
        assert!(!is_valid_serial("a/b"));
        assert!(!is_valid_serial("a+b"));
        assert!(!is_valid_serial("a.b"));
    }
}
