use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Human-readable notice carried inside key=value envelopes so that anyone
/// who sees raw protocol traffic in the chat log knows it is machine data.
pub const ENVELOPE_NOTICE: &str = "sync data, safe to ignore";

/// Fixed prefix of the JSON-blob envelope. Decoding anchors on this prefix
/// rather than the full bracket frame because some hosts strip or rewrite
/// the leading text when rendering.
pub const STATE_SYNC_PREFIX: &str = "[[n21:state-sync||";

const ENVELOPE_CLOSE: &str = "]]";

/// Reserved pair key used to multiplex logical message types over the one
/// shared chat feed.
pub const CATEGORY_KEY: &str = "key";

static KV_ENVELOPE: LazyLock<Regex> = LazyLock::new(|| {
    // Notice text never contains '|'; payload runs to the last "]]".
    Regex::new(r"\[\[n21:[^|]*\|\|(.*)\]\]").expect("kv envelope pattern")
});

/// Flat string payload carried by the key=value envelope.
pub type Fields = BTreeMap<String, String>;

/// Encode a flat payload as a chat-safe key=value envelope.
///
/// Values are escaped (`\` -> `\\`, `|` -> `\|`, `=` -> `\=`) and joined as
/// `key=value` pairs on unescaped `|`. When `category` is given it is
/// prepended as a reserved `key=<category>` pair. An empty payload yields an
/// empty string, which callers must treat as "do not send".
pub fn encode(payload: &Fields, category: Option<&str>) -> String {
    let mut pairs: Vec<String> = Vec::with_capacity(payload.len() + 1);
    if let Some(category) = category {
        pairs.push(format!("{}={}", CATEGORY_KEY, escape_value(category)));
    }
    for (key, value) in payload {
        pairs.push(format!("{}={}", key, escape_value(value)));
    }
    if pairs.is_empty() {
        return String::new();
    }
    format!("[[n21: {} ||{}]]", ENVELOPE_NOTICE, pairs.join("|"))
}

/// Decode the payload portion of a key=value envelope.
///
/// Splits on `|` not preceded by `\`, then each pair on its first `=`.
/// Returns `None` when no pair parses; the caller then treats the message as
/// ordinary chat. Never panics on malformed input.
pub fn decode(payload: &str) -> Option<Fields> {
    let mut fields = Fields::new();
    for pair in split_unescaped(payload) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        fields.insert(key.to_string(), unescape_value(value));
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

/// Extract the payload portion of a key=value envelope from a full chat
/// message, or `None` when the message is not one of ours.
pub fn extract_kv_payload(message: &str) -> Option<&str> {
    KV_ENVELOPE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Wrap a serializable value in the JSON-blob envelope.
///
/// Returns `None` when serialization fails; callers treat that as "do not
/// send" rather than an error.
pub fn encode_json<T: Serialize>(value: &T) -> Option<String> {
    let json = serde_json::to_string(value).ok()?;
    Some(format!("{}{}{}", STATE_SYNC_PREFIX, json, ENVELOPE_CLOSE))
}

/// Unwrap and parse a JSON-blob envelope from a full chat message.
///
/// Anchors on the fixed prefix wherever it appears and on the **last** `]]`
/// in the message, so a JSON payload containing `]]` inside a string still
/// decodes. Malformed input yields `None`.
pub fn decode_json<T: DeserializeOwned>(message: &str) -> Option<T> {
    let start = message.find(STATE_SYNC_PREFIX)? + STATE_SYNC_PREFIX.len();
    let end = message.rfind(ENVELOPE_CLOSE)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&message[start..end]).ok()
}

fn escape_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('|', "\\|")
        .replace('=', "\\=")
}

// Replacement order mirrors encode in reverse; pre-escaped input is a known
// limitation and is not corrected.
fn unescape_value(value: &str) -> String {
    value
        .replace("\\=", "=")
        .replace("\\|", "|")
        .replace("\\\\", "\\")
}

fn split_unescaped(payload: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let bytes = payload.as_bytes();
    let mut start = 0;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b'|' => {
                parts.push(&payload[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&payload[start..]);
    parts
}
