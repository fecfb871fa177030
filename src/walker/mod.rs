//! Stepping and walking machines through a spec.
//!
//! - [`Spec::step`] performs one transition attempt from a [`State`]:
//!   run the node's action (if any), then try the node's branches in order.
//! - [`Spec::walk`] repeats steps under a [`Control`] budget, feeding pending
//!   messages one at a time, stopping at a fixed point, the step limit or a
//!   breakpoint.
//!
//! Both are synchronous and touch no shared state; actions receive a
//! cancellation token they may honor.

mod step;
mod walk;

use crate::action::Events;
use crate::matcher::Bindings;
use crate::types::WalkerConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// State
// =============================================================================

/// A machine's complete mutable identity between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub node: String,
    #[serde(default)]
    pub bs: Bindings,
}

impl State {
    pub fn new(node: impl Into<String>, bs: Bindings) -> Self {
        Self {
            node: node.into(),
            bs,
        }
    }

    pub fn at(node: impl Into<String>) -> Self {
        Self::new(node, Bindings::new())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.bs) {
            Ok(js) => write!(f, "{}/{}", self.node, js),
            Err(_) => write!(f, "{}/{{*}}", self.node),
        }
    }
}

// =============================================================================
// Strides and walks
// =============================================================================

/// One attempted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stride {
    pub from: State,

    /// `None` when the step made no progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<State>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed: Option<Value>,

    #[serde(default)]
    pub events: Events,
}

impl Stride {
    pub fn new(from: State) -> Self {
        Self {
            from,
            to: None,
            consumed: None,
            events: Events::default(),
        }
    }
}

/// Why a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Went as far as the spec allowed.
    Done,
    /// Too many steps.
    Limited,
    /// The spec couldn't be stepped at all.
    InternalError,
    /// A breakpoint matched the current state.
    BreakpointReached,
}

/// Everything one walk did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Walked {
    pub strides: Vec<Stride>,

    pub stopped_because: StopReason,

    /// Pending messages the walk never consumed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Walked {
    fn new(capacity: usize) -> Self {
        Self {
            strides: Vec::with_capacity(capacity.min(1024)),
            stopped_because: StopReason::Done,
            remaining: Vec::new(),
            breakpoint: None,
            error: None,
        }
    }

    pub fn first_state(&self) -> Option<&State> {
        self.strides.first().map(|s| &s.from)
    }

    /// The last state the walk reached, if it moved at all.
    pub fn to(&self) -> Option<&State> {
        self.strides.iter().rev().find_map(|s| s.to.as_ref())
    }

    /// Every emitted message, in stride order.
    pub fn emitted(&self) -> impl Iterator<Item = &Value> {
        self.strides.iter().flat_map(|s| s.events.emitted.iter())
    }

    /// Node names visited, one per stride that moved.
    pub fn path(&self) -> Vec<&str> {
        self.strides
            .iter()
            .filter_map(|s| s.to.as_ref().map(|st| st.node.as_str()))
            .collect()
    }
}

// =============================================================================
// Control
// =============================================================================

/// Predicate over the current state that halts a walk.
pub type Breakpoint = Arc<dyn Fn(&State) -> bool + Send + Sync>;

/// Walk budget, breakpoints and trace switch.
#[derive(Clone)]
pub struct Control {
    pub limit: u32,
    pub breakpoints: BTreeMap<String, Breakpoint>,
    pub traces: bool,
}

impl Control {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            breakpoints: BTreeMap::new(),
            traces: true,
        }
    }

    pub fn from_config(config: &WalkerConfig) -> Self {
        Self {
            traces: config.traces,
            ..Self::new(config.limit)
        }
    }

    pub fn with_breakpoint<F>(mut self, id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&State) -> bool + Send + Sync + 'static,
    {
        self.breakpoints.insert(id.into(), Arc::new(f));
        self
    }

    pub fn without_traces(mut self) -> Self {
        self.traces = false;
        self
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::from_config(&WalkerConfig::default())
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("limit", &self.limit)
            .field("breakpoints", &self.breakpoints.keys().collect::<Vec<_>>())
            .field("traces", &self.traces)
            .finish()
    }
}
