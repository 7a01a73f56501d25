use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::host::{ChatHost, SendOptions};

type DebounceKey = (String, Option<String>);

struct DebounceState {
    key: Option<DebounceKey>,
    pending: Option<tokio::task::JoinHandle<()>>,
}

/// Trailing debounce over the host send primitive, keyed by
/// `(text, sender identity)`.
///
/// The first request for a pair goes out immediately. An identical request
/// arriving again replaces the pending trailing timer, so a burst collapses
/// to the last request after one quiet window. A changed pair supersedes any
/// pending timer, goes out immediately and becomes the tracked pair.
pub(crate) struct DebouncedSender {
    host: Arc<dyn ChatHost>,
    window: Duration,
    state: Mutex<DebounceState>,
}

impl DebouncedSender {
    pub(crate) fn new(host: Arc<dyn ChatHost>, window: Duration) -> Self {
        Self {
            host,
            window,
            state: Mutex::new(DebounceState {
                key: None,
                pending: None,
            }),
        }
    }

    pub(crate) async fn send(&self, text: String, opts: SendOptions) {
        let key: DebounceKey = (text.clone(), opts.sender_id.clone());

        let immediate = {
            let mut state = self.state.lock();
            if let Some(handle) = state.pending.take() {
                // A pending trailing send repeats text that already went out
                // when its pair first arrived, so aborting it loses nothing.
                handle.abort();
            }
            if state.key.as_ref() == Some(&key) {
                let host = Arc::clone(&self.host);
                let window = self.window;
                state.pending = Some(tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    if let Err(e) = host.send(&text, &opts).await {
                        tracing::debug!(host = host.name(), "debounced chat send failed: {e}");
                    }
                }));
                None
            } else {
                state.key = Some(key);
                Some((text, opts))
            }
        };

        if let Some((text, opts)) = immediate {
            if let Err(e) = self.host.send(&text, &opts).await {
                tracing::debug!(host = self.host.name(), "chat send failed: {e}");
            }
        }
    }
}
