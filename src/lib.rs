//! copf-kernel — concept-oriented application runtime core.
//!
//! Kernel dispatch loop, sync engine (and its distributed variant), action
//! log, transport/registry abstraction, lite-query adapter, and flow tracer
//!. The `.concept`/`.sync` parsers, code generators, CLI
//! scaffolding, and concrete domain concepts are out of scope for this
//! crate; `demo` wires up just enough in-process concepts to exercise the
//! core end to end.

pub mod config;
pub mod error;
pub mod kernel;
pub mod lite_query;
pub mod log;
pub mod model;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod tracer;
pub mod transport;

pub mod demo;

pub use error::KernelError;
pub use kernel::{Kernel, Response};
pub use model::{
    ActionCompletion, ActionInvocation, Annotation, CompiledSync, Fields, PendingEntry, SyncEdge,
};
