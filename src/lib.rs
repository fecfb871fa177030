//! # Strider - Spec-Driven Message Machines
//!
//! Machines are finite-state programs written as data: a graph of named
//! nodes whose branches match incoming messages (or the machine's own
//! bindings) against patterns, optionally run an action, and move on.
//!
//! - [`matcher`] unifies patterns with facts, producing binding sets
//! - [`spec`] models, loads and compiles machine specs
//! - [`walker`] steps and walks a machine through pending messages
//! - [`action`] defines actions and the interpreters that compile them
//! - [`crew`] runs groups of machines that feed each other messages
//! - [`timers`] schedules cancellable delayed messages
//! - [`bus`] carries crew traffic to subscribers
//! - [`ops`] exposes the runtime as method/body requests
//!
//! ## Architecture
//!
//! ```text
//!   submit / ops ─→ work queue ─→ dispatcher (Semaphore-bounded workers)
//!                       ↑                     │
//!                       │            crew lock│
//!                       │     ┌───────────────┴───────────────┐
//!                       │     │  route → walk each machine    │
//!                       │     │  → persist → apply in memory  │
//!                       │     └───────────────┬───────────────┘
//!                       └──── emitted ────────┘──→ bus (outbound)
//!                       ↑
//!                     timers
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod action;
pub mod bus;
pub mod crew;
pub mod matcher;
pub mod ops;
pub mod spec;
pub mod timers;
pub mod types;
pub mod walker;

// Internal utilities
pub mod observability;
pub mod validation;

pub use action::{Action, ActionSource, Execution, FuncAction, Interpreter, InterpreterRegistry, NativeInterpreter};
pub use crew::{CrewRuntime, MachineInit, SpecLibrary, SpecSource};
pub use matcher::{Bindings, Matcher};
pub use spec::{Spec, Specter, UpdatableSpec};
pub use types::{Config, CrewId, Error, MachineId, Result};
pub use walker::{Control, State, StopReason, Walked};
