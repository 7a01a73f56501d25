use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use super::ChangeGuard;
use crate::codec::{self, Fields};
use crate::config::SyncConfig;
use crate::host::{ChatEvent, Roster, SendOptions};
use crate::role::{self, Role};
use crate::transport::{ChatTransport, Subscription, Verdict};

/// Category pair multiplexing this store's traffic over the shared feed.
pub const SESSION_CATEGORY: &str = "state.session";

/// Change listener invoked with `(new_state, old_state)`.
pub type SessionListener = Arc<dyn Fn(&Fields, &Fields) + Send + Sync>;

/// Per-key merge variant of the replicated state: a flat string map owned by
/// the Authority, merged shallowly on Replicas, no local persistence.
///
/// Deliberately asymmetric: only Replicas install an inbound listener, so the
/// Authority never processes its own echo and needs no pending-update
/// bookkeeping. Inbound envelopes are accepted only from the roster's
/// Authority participant; anything else is ignored.
pub struct SessionStateStore {
    transport: Arc<ChatTransport>,
    roster: Arc<dyn Roster>,
    config: SyncConfig,
    state: Mutex<Fields>,
    listeners: Arc<Mutex<Vec<(u64, SessionListener)>>>,
    next_listener_id: AtomicU64,
    ready_tx: watch::Sender<Option<Role>>,
    authority_id: Mutex<Option<String>>,
    subscription: Mutex<Option<Subscription>>,
}

impl SessionStateStore {
    pub fn start(
        transport: Arc<ChatTransport>,
        roster: Arc<dyn Roster>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(None);
        let store = Arc::new(Self {
            transport,
            roster,
            config,
            state: Mutex::new(Fields::new()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            ready_tx,
            authority_id: Mutex::new(None),
            subscription: Mutex::new(None),
        });
        tokio::spawn(init_store(Arc::downgrade(&store)));
        store
    }

    /// Read-only snapshot of the current session state.
    pub fn state(&self) -> Fields {
        self.state.lock().clone()
    }

    pub fn role(&self) -> Option<Role> {
        *self.ready_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.role().is_some()
    }

    pub fn is_authority(&self) -> bool {
        self.role().is_some_and(Role::is_authority)
    }

    /// Wait for role resolution; may pend indefinitely if the roster never
    /// loads. Timeout policy belongs to the caller.
    pub async fn wait_ready(&self) -> Role {
        let mut rx = self.ready_tx.subscribe();
        loop {
            if let Some(role) = *rx.borrow_and_update() {
                return role;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Register a change listener invoked with `(new_state, old_state)`.
    /// Dropping the guard unsubscribes.
    pub fn on_change<F>(&self, listener: F) -> ChangeGuard<SessionListener>
    where
        F: Fn(&Fields, &Fields) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        ChangeGuard::new(id, Arc::clone(&self.listeners))
    }

    /// Merge a partial map into the session state and broadcast the changed
    /// keys. Authority only. Keys that already hold the given value are
    /// dropped; when nothing actually differs, nothing is sent and no
    /// listener fires.
    pub async fn set_state(&self, partial: Fields) -> Result<()> {
        match self.role() {
            Some(Role::Authority) => {}
            Some(Role::Replica) => {
                tracing::warn!("replica attempted to mutate session state; rejected");
                bail!("only the authority may mutate the session state");
            }
            None => {
                tracing::warn!("session store is not ready; mutation rejected");
                bail!("session store is not ready");
            }
        }

        let (changed, new_state, old_state) = {
            let mut state = self.state.lock();
            let changed: Fields = partial
                .into_iter()
                .filter(|(key, value)| state.get(key) != Some(value))
                .collect();
            if changed.is_empty() {
                return Ok(());
            }
            let old = state.clone();
            for (key, value) in &changed {
                state.insert(key.clone(), value.clone());
            }
            (changed, state.clone(), old)
        };

        // Optimistic local notify, before the send.
        self.notify(&new_state, &old_state);

        let text = codec::encode(&changed, Some(SESSION_CATEGORY));
        self.transport
            .send_debounced(&text, &SendOptions::hidden())
            .await;
        Ok(())
    }

    /// Detach the transport subscription. The store keeps its last state but
    /// stops tracking inbound updates.
    pub fn teardown(&self) {
        self.subscription.lock().take();
    }

    fn handle_inbound(&self, event: &ChatEvent) -> Verdict {
        let Some(payload) = codec::extract_kv_payload(&event.text) else {
            return Verdict::Pass;
        };
        let Some(fields) = codec::decode(payload) else {
            return Verdict::Pass;
        };
        if fields.get(codec::CATEGORY_KEY).map(String::as_str) != Some(SESSION_CATEGORY) {
            return Verdict::Pass;
        }

        // Validate the sender against the roster's Authority, not against
        // message content; stale or spoofed senders are ignored.
        let authority = self.authority_id.lock().clone();
        if authority.as_deref() != Some(event.sender_id.as_str()) {
            return Verdict::Pass;
        }

        let merged = {
            let mut state = self.state.lock();
            let changed: Fields = fields
                .into_iter()
                .filter(|(key, _)| key != codec::CATEGORY_KEY)
                .filter(|(key, value)| state.get(key) != Some(value))
                .collect();
            if changed.is_empty() {
                None
            } else {
                let old = state.clone();
                for (key, value) in changed {
                    state.insert(key, value);
                }
                Some((state.clone(), old))
            }
        };
        if let Some((new_state, old_state)) = merged {
            self.notify(&new_state, &old_state);
        }
        Verdict::Swallow
    }

    fn notify(&self, new_state: &Fields, old_state: &Fields) {
        let listeners: Vec<SessionListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(new_state, old_state);
        }
    }
}

async fn init_store(weak: Weak<SessionStateStore>) {
    let mut warned = false;
    let (role, authority) = loop {
        let Some(store) = weak.upgrade() else { return };
        let marker = store.config.all_access_marker.clone();
        let resolved = store.roster.list().and_then(|participants| {
            let role = role::resolve_role(&participants, &marker)?;
            Some((role, role::authority_id(&participants, &marker)))
        });
        match resolved {
            Some(result) => break result,
            None => {
                if !warned {
                    tracing::warn!("roster not available; session store stays pending");
                    warned = true;
                }
                let retry = store.config.roster_retry();
                drop(store);
                tokio::time::sleep(retry).await;
            }
        }
    };

    let Some(store) = weak.upgrade() else { return };
    *store.authority_id.lock() = authority;

    // Only replicas listen; the authority never sees its own traffic here.
    if !role.is_authority() {
        let inbound = weak.clone();
        let sub = store.transport.on_message(move |event| {
            Ok(match inbound.upgrade() {
                Some(store) => store.handle_inbound(event),
                None => Verdict::Pass,
            })
        });
        *store.subscription.lock() = Some(sub);
    }

    // send_replace stores the value even with no receiver subscribed yet;
    // plain send would drop it and leave the store unready forever.
    store.ready_tx.send_replace(Some(role));
    tracing::debug!(role = role.as_str(), "session store ready");
}
