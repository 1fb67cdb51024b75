//! Host-side bridge for a foreign incremental engine.
//!
//! The [`runtime`] module owns everything that crosses the foreign boundary:
//! the handle registry, the value bridge with zero-copy views, the execution
//! context stack, the collection operators offered to user closures and the
//! async continuation bridge. [`memory`] provides an in-process engine that
//! speaks the same contract, and [`server`] exposes the engine's collections
//! over the reactive resource protocol.

pub mod memory;
pub mod runtime;
pub mod server;

pub use runtime::{
    Accumulator, AsyncLazy, AsyncValue, BridgeError, Entry, HostValue, LazyCompute, LazySelf,
    MapOutput, Mapper, NonEmptyIter, Operators, Rejection, RuntimeConfig, RuntimeHandle, Service,
    Value,
};
pub use server::{router, serve, AppState, ServerConfig};
