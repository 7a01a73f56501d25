//! State replication over a shared group chat feed.
//!
//! One privileged participant (the Authority) keeps every other
//! participant's local copy of a shared state object synchronized, using a
//! channel that was never designed for it: a plain chat feed shared with
//! human conversation. There is no peer-to-peer link, no server persistence
//! API and no acknowledgements — only "post a line of text, everyone
//! connected eventually sees it".
//!
//! The crate is built leaf-first:
//!
//! - [`codec`] turns structured payloads into chat-safe `[[n21: ...]]`
//!   envelopes and back; malformed input is ordinary chat, never an error.
//! - [`transport::ChatTransport`] taps the host's chat pipe once, dispatches
//!   inbound items to subscribers in order and hides protocol traffic from
//!   the human-visible log; outbound it offers a plain and a debounced send.
//! - [`store::ReplicatedStore`] is the full-object, single-writer store:
//!   durable Authority snapshot, optimistic local apply, self-echo
//!   suppression via per-broadcast update ids, and a membership poll that
//!   re-broadcasts the full state whenever the connected-peer set changes.
//! - [`store::SessionStateStore`] is the simpler per-key merge store:
//!   sender-validated, debounced, ephemeral.
//!
//! The design assumes exactly one participant resolves to Authority per
//! session. If two qualify, both broadcast and replica state oscillates
//! between them; there is deliberately no election logic.

pub mod codec;
pub mod config;
pub mod host;
pub mod role;
pub mod store;
pub mod transport;

pub use config::SyncConfig;
pub use host::{ChatEvent, ChatHost, Participant, Roster, SendOptions, SnapshotStorage, Visibility};
pub use role::Role;
pub use store::{
    ChangeGuard, MemorySnapshotStorage, ReplicatedStore, SessionStateStore, SqliteSnapshotStorage,
};
pub use transport::{ChatTransport, Subscription, Verdict};
