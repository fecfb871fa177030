//! The built-in `timers` machine.
//!
//! Every crew answers messages addressed `"to": "timers"` unless it has a
//! machine of its own with that id:
//!
//! ```json
//! {"to": "timers", "makeTimer": {"id": "t1", "in": "5s", "message": {"ding": true}}}
//! {"to": "timers", "deleteTimer": "t1"}
//! ```
//!
//! Replies are emitted back into the crew: `{"changed": id}` for a new
//! timer, `{"deleted": id}` for a removal, `{"id": id, "error": text}` on
//! failure.

use crate::timers::Timers;
use crate::types::{Error, Result};
use serde_json::{json, Value};
use std::time::Duration;

/// Machine id the crew runtime reserves for timer requests.
pub const TIMERS_MACHINE: &str = "timers";

/// Handle one request to the timers machine. Returns the replies to emit.
pub fn handle_timers_message(timers: &Timers, message: &Value) -> Vec<Value> {
    let mut replies = Vec::new();

    if let Some(request) = message.get("makeTimer") {
        let id = request
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let reply = match make_timer(timers, &id, request) {
            Ok(()) => json!({"changed": id}),
            Err(e) => json!({"id": id, "error": e.to_string()}),
        };
        replies.push(reply);
    }

    if let Some(request) = message.get("deleteTimer") {
        let id = match request {
            Value::String(s) => Some(s.as_str()),
            other => other.get("id").and_then(Value::as_str),
        };
        let reply = match id {
            Some(id) => match timers.rem(id) {
                Ok(()) => json!({"deleted": id}),
                Err(e) => json!({"id": id, "error": e.to_string()}),
            },
            None => json!({"error": "deleteTimer needs an id"}),
        };
        replies.push(reply);
    }

    if replies.is_empty() {
        tracing::debug!("Ignoring timers message without a request: {}", message);
    }
    replies
}

fn make_timer(timers: &Timers, id: &str, request: &Value) -> Result<()> {
    let delay = request
        .get("in")
        .ok_or_else(|| Error::validation("makeTimer needs 'in'"))
        .and_then(parse_delay)?;
    let message = request
        .get("message")
        .cloned()
        .ok_or_else(|| Error::validation("makeTimer needs a 'message'"))?;
    timers.add(id, message, delay)
}

/// `"1m30s"` style text, or a number of seconds.
fn parse_delay(v: &Value) -> Result<Duration> {
    match v {
        Value::String(s) => humantime_serde::re::humantime::parse_duration(s)
            .map_err(|e| Error::validation(format!("bad timer delay '{}': {}", s, e))),
        Value::Number(n) => n
            .as_f64()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| Error::validation(format!("bad timer delay {}", n))),
        other => Err(Error::validation(format!("bad timer delay {}", other))),
    }
}
