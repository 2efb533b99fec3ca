//! Appliance Event Model
//!
//! Types and pure functions for the events flowing through the daemon:
//! the upstream SSE event vocabulary, the history records synthesized from
//! semantically interesting events, and the brew-vs-cleaning program
//! classification used by the usage aggregations.

use serde_json::Value;

/// Upstream liveness frame. Carries no payload; only refreshes the heartbeat.
pub const KEEP_ALIVE: &str = "KEEP-ALIVE";

/// Upstream status-change event type.
pub const STATUS: &str = "STATUS";

/// Upstream event types that may carry an active-program change.
pub const EVENT: &str = "EVENT";

/// See [`EVENT`].
pub const NOTIFY: &str = "NOTIFY";

/// Synthetic event emitted by the heartbeat monitor to local subscribers.
pub const STREAM_STATUS: &str = "STREAM_STATUS";

/// Synthetic event sent to a subscriber immediately after registration.
pub const CONNECTED: &str = "connected";

/// Synthetic keep-alive event type for local subscribers.
pub const PING: &str = "ping";

/// History record type for persisted status changes.
pub const STATUS_CHANGED: &str = "status_changed";

/// History record type for program starts.
pub const PROGRAM_STARTED: &str = "program_started";

/// Payload item key signalling an active-program change.
const ACTIVE_PROGRAM_KEY: &str = "BSH.Common.Root.ActiveProgram";

/// A record destined for the durable event history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Stored event type (lower-cased upstream type or a synthetic type).
    pub event_type: String,
    /// Stored JSON payload.
    pub payload: Value,
}

impl HistoryRecord {
    /// Create a new history record.
    #[must_use]
    pub const fn new(event_type: String, payload: Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

/// Derive the history records for one decoded upstream event.
///
/// Every event is recorded verbatim under its lower-cased type. Two kinds of
/// events additionally synthesize derived records:
///
/// - `STATUS` events produce a [`STATUS_CHANGED`] record wrapping the
///   original event and payload.
/// - `EVENT`/`NOTIFY` events whose `items` contain an active-program entry
///   with a non-null value produce one [`PROGRAM_STARTED`] record per such
///   entry, carrying the program key and its options. The value is either an
///   object (`{"key": ..., "options": [...]}`) or the bare program key.
#[must_use]
pub fn derive_history_records(event_type: &str, payload: &Value) -> Vec<HistoryRecord> {
    let mut records = vec![HistoryRecord::new(
        event_type.to_lowercase(),
        payload.clone(),
    )];

    match event_type {
        STATUS => {
            records.push(HistoryRecord::new(
                STATUS_CHANGED.to_string(),
                serde_json::json!({
                    "event": event_type,
                    "payload": payload,
                }),
            ));
        }
        EVENT | NOTIFY => {
            let items = payload
                .get("items")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for item in items {
                if item.get("key").and_then(Value::as_str) != Some(ACTIVE_PROGRAM_KEY) {
                    continue;
                }
                match item.get("value") {
                    Some(Value::Object(value)) => {
                        let program = value
                            .get("key")
                            .and_then(Value::as_str)
                            .unwrap_or("Unknown");
                        let options = value.get("options").cloned().unwrap_or(Value::Array(vec![]));
                        records.push(HistoryRecord::new(
                            PROGRAM_STARTED.to_string(),
                            serde_json::json!({
                                "program": program,
                                "options": options,
                            }),
                        ));
                    }
                    Some(Value::String(program)) => {
                        records.push(HistoryRecord::new(
                            PROGRAM_STARTED.to_string(),
                            serde_json::json!({
                                "program": program,
                                "options": [],
                            }),
                        ));
                    }
                    // Null or absent value means a program ended, not started.
                    _ => {}
                }
            }
        }
        _ => {}
    }

    records
}

/// Whether a program key names a brew program rather than a cleaning cycle.
///
/// Cleaning-mode programs are excluded from usage statistics. The heuristic,
/// in order: a `cleaningmodes` namespace is never a brew; a `beverage`
/// namespace always is; known cleaning keywords (`rinsing`, `descaling`,
/// `cleaning`) are excluded; anything else is assumed to be a brew program.
#[must_use]
pub fn is_brew_program(program_key: &str) -> bool {
    if program_key.is_empty() {
        return false;
    }

    let key = program_key.to_lowercase();

    if key.contains("cleaningmodes") {
        return false;
    }
    if key.contains("beverage") {
        return true;
    }

    const CLEANING_KEYWORDS: [&str; 3] = ["rinsing", "descaling", "cleaning"];
    if CLEANING_KEYWORDS.iter().any(|kw| key.contains(kw)) {
        return false;
    }

    true
}
