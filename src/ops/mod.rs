//! Transport-agnostic operations facade.
//!
//! A front end (socket server, HTTP handler, queue consumer) decodes a
//! request into a method name and a JSON body, calls [`route_request`] and
//! writes back the envelope from [`respond`].

use crate::crew::{CrewRuntime, MachineInit};
use crate::types::{CrewId, Error, MachineId, Result};
use serde_json::{json, Value};

/// Route one request to the crew runtime.
pub async fn route_request(runtime: &CrewRuntime, method: &str, body: Value) -> Result<Value> {
    tracing::debug!("ops request {}", method);
    match method {
        "MakeCrew" => {
            let cid = crew_id(&body)?;
            runtime.make_crew(&cid).await?;
            Ok(json!({"cid": cid}))
        }

        "RemCrew" => {
            let cid = crew_id(&body)?;
            runtime.rem_crew(&cid).await?;
            Ok(json!({"cid": cid}))
        }

        "GetCrew" => {
            let cid = crew_id(&body)?;
            Ok(serde_json::to_value(runtime.get_crew(&cid).await?)?)
        }

        "AddMachine" => {
            let cid = crew_id(&body)?;
            let init: MachineInit = serde_json::from_value(field(&body, "machine")?.clone())?;
            let machine = runtime.add_machine(&cid, init).await?;
            Ok(serde_json::to_value(machine)?)
        }

        "RemMachine" => {
            let cid = crew_id(&body)?;
            let mid = MachineId::from_string(str_field(&body, "mid")?)?;
            runtime.rem_machine(&cid, &mid).await?;
            Ok(json!({"mid": mid}))
        }

        "Process" => {
            let cid = crew_id(&body)?;
            let message = field(&body, "message")?.clone();
            let processed = runtime.process(&cid, message).await?;
            Ok(serde_json::to_value(processed)?)
        }

        "Submit" => {
            let cid = crew_id(&body)?;
            runtime.submit(&cid, field(&body, "message")?.clone())?;
            Ok(json!({"queued": true}))
        }

        "AddTimer" => {
            let cid = crew_id(&body)?;
            let id = str_field(&body, "id")?;
            let delay = str_field(&body, "in")?;
            let delay = humantime_serde::re::humantime::parse_duration(&delay)
                .map_err(|e| Error::validation(format!("bad delay '{}': {}", delay, e)))?;
            runtime
                .add_timer(&cid, &id, field(&body, "message")?.clone(), delay)
                .await?;
            Ok(json!({"changed": id}))
        }

        "RemTimer" => {
            let cid = crew_id(&body)?;
            let id = str_field(&body, "id")?;
            runtime.rem_timer(&cid, &id).await?;
            Ok(json!({"deleted": id}))
        }

        _ => Err(Error::not_found(format!("Unknown method: {}", method))),
    }
}

/// Wrap a result in the `{"ok": ..}` response envelope.
pub fn respond(result: Result<Value>) -> Value {
    match result {
        Ok(result) => json!({"ok": true, "result": result}),
        Err(e) => json!({
            "ok": false,
            "error": {
                "code": e.code(),
                "message": e.to_string(),
            }
        }),
    }
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn str_field(body: &Value, key: &str) -> Result<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}

fn field<'a>(body: &'a Value, key: &str) -> Result<&'a Value> {
    body.get(key)
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}

fn crew_id(body: &Value) -> Result<CrewId> {
    CrewId::from_string(str_field(body, "cid")?)
}
