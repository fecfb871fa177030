//! Crews: named groups of machines sharing a message stream.
//!
//! - [`CrewRuntime`] processes messages and re-injects what machines emit
//! - [`Storage`] persists machine states
//! - [`SpecProvider`] resolves a machine's spec
//! - [`Router`] picks which machines see a message
//! - the reserved `timers` machine schedules delayed messages

mod cache;
mod machine;
mod native;
mod provider;
mod router;
mod runtime;
mod storage;

pub use cache::CrewCache;
pub use machine::{Crew, Machine, MachineInit, MachineState, SpecSource};
pub use native::{handle_timers_message, TIMERS_MACHINE};
pub use provider::{SpecLibrary, SpecProvider, DEFAULT_SPEC_CACHE_CAPACITY};
pub use router::{DirectedRouter, Route, Router};
pub use runtime::{CrewRuntime, CrewRuntimeBuilder, Processed};
pub use storage::{MemoryStorage, NoopStorage, Storage};
