//! Choosing which machines in a crew see a message.

use super::machine::Crew;
use crate::types::{Error, MachineId, Result};
use serde_json::Value;
use std::fmt;

/// Routing decision for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Every machine in the crew.
    All,
    /// Only these machines, in this order. Ids need not exist.
    Machines(Vec<MachineId>),
}

/// Picks a message's recipients.
pub trait Router: Send + Sync + fmt::Debug {
    fn route(&self, crew: &Crew, message: &Value) -> Result<Route>;
}

/// Routes on the message's `to` property:
/// - absent or `"*"`: every machine
/// - a string: that machine
/// - an array of strings: those machines
/// - `{"mid": id}`: that machine
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectedRouter;

impl Router for DirectedRouter {
    fn route(&self, _crew: &Crew, message: &Value) -> Result<Route> {
        let Some(to) = message.get("to") else {
            return Ok(Route::All);
        };
        match to {
            Value::String(s) if s == "*" => Ok(Route::All),
            Value::String(s) => Ok(Route::Machines(vec![MachineId::from(s.as_str())])),
            Value::Array(xs) => xs
                .iter()
                .map(|x| {
                    x.as_str()
                        .map(MachineId::from)
                        .ok_or_else(|| Error::validation(format!("bad 'to' entry: {}", x)))
                })
                .collect::<Result<Vec<_>>>()
                .map(Route::Machines),
            Value::Object(m) => m
                .get("mid")
                .and_then(Value::as_str)
                .map(|mid| Route::Machines(vec![MachineId::from(mid)]))
                .ok_or_else(|| Error::validation("'to' object needs a 'mid'")),
            other => Err(Error::validation(format!("bad 'to': {}", other))),
        }
    }
}
