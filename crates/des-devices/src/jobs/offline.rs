//! Transitions inferred from signals.
//!
//! The device is the source of truth for its own lifecycle. When its signals
//! show it started or ended a job without a handshake, the missing records
//! are synthesized from the cache and the confirmed paths run as usual.

use std::sync::Arc;

use des_core::models::{Source, StateSnapshot};
use tracing::info;

use super::JobEngine;
use crate::error::Result;
use crate::messages::JobBundle;
use crate::registry::DeviceCacheEntry;

/// Start time encoded in a generated job name (`<serial>_<millis>`).
pub fn start_from_name(serial: &str, name: &str) -> Option<i64> {
    name.strip_prefix(serial)?
        .strip_prefix('_')?
        .parse::<i64>()
        .ok()
        .filter(|t| *t > 0)
}

impl JobEngine {
    /// Start `tag` as a job the device opened on its own.
    ///
    /// `reported` is the state that revealed the job, if the trigger was a
    /// state signal; otherwise the cached state is used.
    pub(crate) async fn offline_start_locked(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        tag: &str,
        time: i64,
        reported: Option<StateSnapshot>,
    ) -> Result<()> {
        let serial = entry.serial();
        let t = start_from_name(serial, tag).unwrap_or(time);
        info!(serial = %serial, job = %tag, "Offline job start detected");

        let base = reported.unwrap_or_else(|| StateSnapshot {
            source: Source::server(t),
            ..(*entry.state()).clone()
        });
        let state = StateSnapshot {
            source: base.source.at(t),
            job_name: tag.to_string(),
            ..base
        };
        self.confirm_start_locked(entry, bundle_of(state), true)
            .await
    }

    /// End the active job the device closed on its own.
    pub(crate) async fn offline_end_locked(
        &self,
        entry: &Arc<DeviceCacheEntry>,
        time: i64,
        reported: Option<StateSnapshot>,
    ) -> Result<()> {
        info!(
            serial = %entry.serial(),
            job = %entry.state().job_name,
            "Offline job end detected"
        );
        let base = reported.unwrap_or_else(|| StateSnapshot {
            source: Source::server(time),
            ..(*entry.state()).clone()
        });
        let state = StateSnapshot {
            source: base.source.at(time),
            ..base
        };
        self.confirm_end_locked(entry, bundle_of(state), true).await
    }
}

fn bundle_of(state: StateSnapshot) -> JobBundle {
    JobBundle {
        state,
        admin: None,
        header: None,
        config: None,
        event: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_from_generated_name() {
        assert_eq!(
            start_from_name("DEMO42", "DEMO42_1700000999999"),
            Some(1_700_000_999_999)
        );
        assert_eq!(start_from_name("DEMO42", "DEMO42_CMDARCHIVE"), None);
        assert_eq!(start_from_name("DEMO42", "OTHER_1700000999999"), None);
        assert_eq!(start_from_name("DEMO42", "DEMO42_-5"), None);
    }
}
