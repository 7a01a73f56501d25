use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use uuid::Uuid;

use super::ChangeGuard;
use crate::codec;
use crate::config::SyncConfig;
use crate::host::{ChatEvent, Roster, SendOptions, SnapshotStorage};
use crate::role::{self, Role};
use crate::transport::{ChatTransport, Subscription, Verdict};

/// Storage key under which the Authority persists its full-state snapshot.
pub const SNAPSHOT_KEY: &str = "n21.replicated-state";

/// Upper bound on remembered broadcast ids. Echoes normally scrub the set,
/// but a host that does not loop sender traffic back never does.
const PENDING_UPDATE_CAP: usize = 256;

/// Wire shape of one full-state broadcast. `updateId` exists only so the
/// Authority can recognize its own echo; it carries no ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateEnvelope {
    update_id: String,
    state: Value,
    timestamp: i64,
}

/// Change listener invoked with `(new_state, old_state)`.
pub type StateListener = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Single-writer, full-replace replicated state.
///
/// The Authority's copy is ground truth: every `set`/`update` persists a
/// snapshot, notifies local listeners optimistically and broadcasts the full
/// object. Replicas hold a read-only mirror, replaced wholesale on every
/// inbound update. The only resync mechanism is the Authority's
/// connected-peer poll: any membership change re-broadcasts the full state,
/// which is what catches late joiners and reloads.
pub struct ReplicatedStore {
    transport: Arc<ChatTransport>,
    roster: Arc<dyn Roster>,
    storage: Option<Arc<dyn SnapshotStorage>>,
    config: SyncConfig,
    state: Mutex<Value>,
    pending_updates: Mutex<HashSet<String>>,
    listeners: Arc<Mutex<Vec<(u64, StateListener)>>>,
    next_listener_id: AtomicU64,
    ready_tx: watch::Sender<Option<Role>>,
    subscription: Mutex<Option<Subscription>>,
}

impl ReplicatedStore {
    /// Construct the store and spawn its start-up sequence: wait for the
    /// roster, resolve the role once, load the Authority snapshot, install
    /// the inbound hook and (Authority only) the membership poll.
    pub fn start(
        transport: Arc<ChatTransport>,
        roster: Arc<dyn Roster>,
        storage: Option<Arc<dyn SnapshotStorage>>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(None);
        let store = Arc::new(Self {
            transport,
            roster,
            storage,
            config,
            state: Mutex::new(Value::Object(serde_json::Map::new())),
            pending_updates: Mutex::new(HashSet::new()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            ready_tx,
            subscription: Mutex::new(None),
        });
        tokio::spawn(init_store(Arc::downgrade(&store)));
        store
    }

    /// Read-only snapshot of the current state.
    pub fn state(&self) -> Value {
        self.state.lock().clone()
    }

    /// Role resolved at start-up, or `None` while the roster is pending.
    pub fn role(&self) -> Option<Role> {
        *self.ready_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.role().is_some()
    }

    pub fn is_authority(&self) -> bool {
        self.role().is_some_and(Role::is_authority)
    }

    /// Wait for role resolution. May pend indefinitely when the roster never
    /// loads; timeout policy belongs to the caller.
    pub async fn wait_ready(&self) -> Role {
        let mut rx = self.ready_tx.subscribe();
        loop {
            if let Some(role) = *rx.borrow_and_update() {
                return role;
            }
            if rx.changed().await.is_err() {
                // Sender is owned by self; "never ready" is the documented
                // long-term state here.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Register a change listener invoked with `(new_state, old_state)` on
    /// every accepted transition. Dropping the guard unsubscribes.
    pub fn on_change<F>(&self, listener: F) -> ChangeGuard<StateListener>
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        ChangeGuard::new(id, Arc::clone(&self.listeners))
    }

    /// Replace the state wholesale. Authority only.
    pub async fn set(&self, new_state: Value) -> Result<()> {
        self.mutate(new_state, false).await
    }

    /// Shallow-merge a partial object into the state. Authority only.
    pub async fn update(&self, partial: Value) -> Result<()> {
        self.mutate(partial, true).await
    }

    /// Re-broadcast the full current state without changing it. Authority
    /// only. This is what membership changes trigger.
    pub async fn broadcast(&self) -> Result<()> {
        self.ensure_authority()?;
        let state = self.state();
        let update_id = Uuid::new_v4().to_string();
        remember_pending(&mut self.pending_updates.lock(), update_id.clone());
        self.send_envelope(update_id, state).await;
        Ok(())
    }

    async fn mutate(&self, value: Value, merge: bool) -> Result<()> {
        self.ensure_authority()?;
        let (new_state, old_state) = {
            let mut state = self.state.lock();
            let old = state.clone();
            let new = if merge {
                shallow_merge(&old, value)
            } else {
                value
            };
            *state = new.clone();
            (new, old)
        };

        self.persist_snapshot(&new_state);

        let update_id = Uuid::new_v4().to_string();
        remember_pending(&mut self.pending_updates.lock(), update_id.clone());

        // Optimistic local apply, before the network round-trip.
        self.notify(&new_state, &old_state);

        self.send_envelope(update_id, new_state).await;
        Ok(())
    }

    fn ensure_authority(&self) -> Result<()> {
        match self.role() {
            Some(Role::Authority) => Ok(()),
            Some(Role::Replica) => {
                tracing::warn!("replica attempted to mutate replicated state; rejected");
                bail!("only the authority may mutate the replicated state")
            }
            None => {
                tracing::warn!("replicated store is not ready; mutation rejected");
                bail!("replicated store is not ready")
            }
        }
    }

    async fn send_envelope(&self, update_id: String, state: Value) {
        let envelope = UpdateEnvelope {
            update_id,
            state,
            timestamp: Utc::now().timestamp_millis(),
        };
        let Some(text) = codec::encode_json(&envelope) else {
            tracing::warn!("failed to encode state update; nothing sent");
            return;
        };
        self.transport.send(&text, &SendOptions::hidden()).await;
    }

    fn handle_inbound(&self, event: &ChatEvent) -> Verdict {
        let Some(envelope) = codec::decode_json::<UpdateEnvelope>(&event.text) else {
            // Not one of ours; let it flow to normal chat handling.
            return Verdict::Pass;
        };
        match self.role() {
            Some(Role::Authority) => {
                // The Authority never applies inbound state to itself; it
                // only scrubs its pending set when its own echo comes back.
                self.pending_updates.lock().remove(&envelope.update_id);
                Verdict::Swallow
            }
            Some(Role::Replica) => {
                let old_state = {
                    let mut state = self.state.lock();
                    std::mem::replace(&mut *state, envelope.state.clone())
                };
                // Unconditional notify: no value-diff suppression here.
                self.notify(&envelope.state, &old_state);
                Verdict::Swallow
            }
            None => Verdict::Pass,
        }
    }

    fn notify(&self, new_state: &Value, old_state: &Value) {
        let listeners: Vec<StateListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(new_state, old_state);
        }
    }

    fn load_snapshot(&self) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        match storage.get(SNAPSHOT_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => *self.state.lock() = value,
                Err(e) => tracing::warn!("stored snapshot is not valid JSON; ignoring: {e}"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("failed to load snapshot; starting empty: {e}"),
        }
    }

    fn persist_snapshot(&self, state: &Value) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let raw = match serde_json::to_string(state) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("failed to serialize snapshot: {e}");
                return;
            }
        };
        if let Err(e) = storage.set(SNAPSHOT_KEY, &raw) {
            // Best-effort: state continues in-memory only.
            tracing::warn!("failed to persist snapshot: {e}");
        }
    }
}

async fn init_store(weak: Weak<ReplicatedStore>) {
    let mut warned = false;
    let role = loop {
        let Some(store) = weak.upgrade() else { return };
        let resolved = store
            .roster
            .list()
            .and_then(|p| role::resolve_role(&p, &store.config.all_access_marker));
        match resolved {
            Some(role) => break role,
            None => {
                if !warned {
                    tracing::warn!("roster not available; replicated store stays pending");
                    warned = true;
                }
                let retry = store.config.roster_retry();
                drop(store);
                tokio::time::sleep(retry).await;
            }
        }
    };

    let Some(store) = weak.upgrade() else { return };
    if role.is_authority() {
        // Load the durable snapshot before the first broadcast.
        store.load_snapshot();
    }

    let inbound = weak.clone();
    let sub = store.transport.on_message(move |event| {
        Ok(match inbound.upgrade() {
            Some(store) => store.handle_inbound(event),
            None => Verdict::Pass,
        })
    });
    *store.subscription.lock() = Some(sub);

    // send_replace stores the value even with no receiver subscribed yet;
    // plain send would drop it and leave the store unready forever.
    store.ready_tx.send_replace(Some(role));
    tracing::debug!(role = role.as_str(), "replicated store ready");

    if role.is_authority() {
        tokio::spawn(run_membership_poll(weak));
    }
}

/// Authority-side connected-peer poll. A change in the peer set (versus the
/// previous sample) re-broadcasts the full state unconditionally; there is
/// no explicit "request sync" message for late joiners to send.
async fn run_membership_poll(weak: Weak<ReplicatedStore>) {
    let mut previous: Option<BTreeSet<String>> = None;
    loop {
        let interval = match weak.upgrade() {
            Some(store) => store.config.resync_poll(),
            None => return,
        };
        tokio::time::sleep(interval).await;

        let Some(store) = weak.upgrade() else { return };
        let Some(participants) = store.roster.list() else {
            continue;
        };
        let peers = role::connected_peer_ids(&participants);
        if let Some(prev) = previous.as_ref() {
            if *prev != peers {
                tracing::debug!("connected peer set changed; re-broadcasting state");
                if let Err(e) = store.broadcast().await {
                    tracing::warn!("membership resync broadcast failed: {e}");
                }
            }
        }
        previous = Some(peers);
    }
}

fn remember_pending(pending: &mut HashSet<String>, update_id: String) {
    if pending.len() >= PENDING_UPDATE_CAP {
        pending.clear();
    }
    pending.insert(update_id);
}

fn shallow_merge(current: &Value, partial: Value) -> Value {
    let Value::Object(additions) = partial else {
        // A non-object partial replaces wholesale, same as `set`.
        return partial;
    };
    let mut merged = match current {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    for (key, value) in additions {
        merged.insert(key, value);
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shallow_merge_overwrites_only_named_keys() {
        let current = json!({"color": "red", "count": 2});
        let merged = shallow_merge(&current, json!({"count": 3}));
        assert_eq!(merged, json!({"color": "red", "count": 3}));
    }

    #[test]
    fn shallow_merge_replaces_nested_objects_wholesale() {
        let current = json!({"camera": {"x": 1, "y": 2}});
        let merged = shallow_merge(&current, json!({"camera": {"x": 5}}));
        assert_eq!(merged, json!({"camera": {"x": 5}}));
    }

    #[test]
    fn shallow_merge_over_a_non_object_starts_fresh() {
        let merged = shallow_merge(&Value::Null, json!({"a": 1}));
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn pending_update_set_is_bounded() {
        let mut pending = HashSet::new();
        for i in 0..(PENDING_UPDATE_CAP * 2) {
            remember_pending(&mut pending, format!("u-{i}"));
        }
        assert!(pending.len() <= PENDING_UPDATE_CAP);
        assert!(pending.contains(&format!("u-{}", PENDING_UPDATE_CAP * 2 - 1)));
    }

    #[test]
    fn update_envelope_uses_camel_case_on_the_wire() {
        let envelope = UpdateEnvelope {
            update_id: "u-1".into(),
            state: json!({"color": "red"}),
            timestamp: 42,
        };
        let raw = serde_json::to_string(&envelope).unwrap();
        assert!(raw.contains("\"updateId\":\"u-1\""));
        assert!(raw.contains("\"state\":{\"color\":\"red\"}"));
        assert!(raw.contains("\"timestamp\":42"));
    }
}
