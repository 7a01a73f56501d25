use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// How a chat item is shown (or hidden) in the human-visible log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Default,
    Hidden,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Hidden => "hidden",
        }
    }

    pub fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "hidden" | "whisper" | "secret" | "gm" => Self::Hidden,
            _ => Self::Default,
        }
    }
}

/// Options for the host's outbound send primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub visibility: Visibility,
    /// Identity to attribute the message to, when the host supports it.
    pub sender_id: Option<String>,
}

impl SendOptions {
    /// Options for protocol traffic: hidden from the human-visible log.
    pub fn hidden() -> Self {
        Self {
            visibility: Visibility::Hidden,
            sender_id: None,
        }
    }

    pub fn hidden_as(sender_id: impl Into<String>) -> Self {
        Self {
            visibility: Visibility::Hidden,
            sender_id: Some(sender_id.into()),
        }
    }
}

/// Parsed convenience view of one inbound chat item, alongside the raw host
/// payload for subscribers that need fields we do not model.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
    pub visibility: Visibility,
    pub raw: serde_json::Value,
}

impl ChatEvent {
    pub fn new(text: impl Into<String>, sender_id: impl Into<String>) -> Self {
        let sender_id = sender_id.into();
        Self {
            text: text.into(),
            sender_name: sender_id.clone(),
            sender_id,
            visibility: Visibility::Default,
            raw: serde_json::Value::Null,
        }
    }
}

/// One participant row from the host's roster capability.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub session_id: String,
    pub teams: Vec<String>,
    pub connected: bool,
    pub user_name: String,
    pub is_me: bool,
}

impl Participant {
    /// Whether this participant qualifies as Authority under the given
    /// all-access marker.
    pub fn has_all_access(&self, marker: &str) -> bool {
        self.teams.iter().any(|team| team == marker)
    }
}

/// The host's chat feed — implement for any group chat the replication core
/// should ride on.
#[async_trait]
pub trait ChatHost: Send + Sync {
    /// Human-readable host name.
    fn name(&self) -> &str;

    /// Forward one line of text to the host's send primitive. No retry, no
    /// queuing; a failure here means the message is simply lost.
    async fn send(&self, text: &str, opts: &SendOptions) -> Result<()>;

    /// Deliver every inbound chat item to `tx` (long-running). Returning,
    /// with or without an error, means the hook point was lost; the
    /// transport reinstalls it with backoff.
    async fn listen(&self, tx: mpsc::Sender<ChatEvent>) -> Result<()>;
}

/// The host's roster/player-list capability.
///
/// `list` returns `None` until the host has loaded its participant data;
/// callers poll rather than assume eventual readiness.
pub trait Roster: Send + Sync {
    fn list(&self) -> Option<Vec<Participant>>;
}

/// Durable local storage, best-effort. Only the Authority ever writes it.
pub trait SnapshotStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_maps_raw_host_values() {
        assert_eq!(Visibility::from_raw("HIDDEN"), Visibility::Hidden);
        assert_eq!(Visibility::from_raw("whisper"), Visibility::Hidden);
        assert_eq!(Visibility::from_raw("public"), Visibility::Default);
        assert_eq!(Visibility::from_raw(""), Visibility::Default);
    }

    #[test]
    fn all_access_marker_requires_exact_team_match() {
        let participant = Participant {
            user_id: "u1".into(),
            session_id: "s1".into(),
            teams: vec!["painters".into(), "all-access".into()],
            connected: true,
            user_name: "Ada".into(),
            is_me: true,
        };
        assert!(participant.has_all_access("all-access"));
        assert!(!participant.has_all_access("all"));
    }
}
