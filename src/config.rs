use serde::Deserialize;
use std::time::Duration;

/// Team marker that identifies the Authority participant in the roster.
pub const DEFAULT_ALL_ACCESS_MARKER: &str = "all-access";

const DEFAULT_RESYNC_POLL_MS: u64 = 1000;
const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 200;
const DEFAULT_ROSTER_RETRY_MS: u64 = 500;
const DEFAULT_LISTENER_INITIAL_BACKOFF_SECS: u64 = 2;
const DEFAULT_LISTENER_MAX_BACKOFF_SECS: u64 = 60;

/// Tunables for the replication core.
///
/// The membership-resync poll and the send-debounce window are inherited
/// constants with no documented rationale; they are configuration rather
/// than invariants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval of the Authority's connected-peer poll; any membership
    /// change triggers a full re-broadcast.
    pub resync_poll_ms: u64,
    /// Trailing debounce window for `send_debounced`.
    pub debounce_window_ms: u64,
    /// Retry interval while waiting for the host roster to become available.
    pub roster_retry_ms: u64,
    /// Initial backoff when the inbound chat listener exits or errors.
    pub listener_initial_backoff_secs: u64,
    /// Backoff ceiling for the inbound chat listener.
    pub listener_max_backoff_secs: u64,
    /// Roster team marker that resolves a participant to Authority.
    pub all_access_marker: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_poll_ms: DEFAULT_RESYNC_POLL_MS,
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
            roster_retry_ms: DEFAULT_ROSTER_RETRY_MS,
            listener_initial_backoff_secs: DEFAULT_LISTENER_INITIAL_BACKOFF_SECS,
            listener_max_backoff_secs: DEFAULT_LISTENER_MAX_BACKOFF_SECS,
            all_access_marker: DEFAULT_ALL_ACCESS_MARKER.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn resync_poll(&self) -> Duration {
        Duration::from_millis(self.resync_poll_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn roster_retry(&self) -> Duration {
        Duration::from_millis(self.roster_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_inherited_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.resync_poll_ms, 1000);
        assert_eq!(config.debounce_window_ms, 200);
        assert_eq!(config.all_access_marker, "all-access");
    }

    #[test]
    fn deserializes_with_partial_overrides() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"debounce_window_ms": 50}"#).expect("valid config");
        assert_eq!(config.debounce_window_ms, 50);
        assert_eq!(config.resync_poll_ms, 1000);
    }
}
