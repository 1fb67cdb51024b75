//! Host-side runtime for a foreign incremental engine.
//!
//! Each runtime owns one engine instance and its [`bridge::Bridge`] on a
//! dedicated OS thread with a Tokio event loop. Callers on other threads talk
//! to it through a [`RuntimeHandle`].

pub mod bridge;
pub mod config;
pub mod context;
pub mod conversion;
pub mod error;
pub mod foreign;
pub mod handle;
pub mod op_driver;
pub mod ops;
pub mod registry;
pub mod runner;
pub mod value;
pub mod view;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

/// Installs the global `tracing` subscriber exactly once.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Safe to call
/// repeatedly; a subscriber installed by someone else is left in place.
pub fn init_tracing_once() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

pub fn is_tracing_initialized() -> bool {
    TRACING.get().is_some()
}

// Re-export key types for convenience
pub use bridge::{Bridge, ResourceSnapshot, RuntimeStats};
pub use config::{RuntimeConfig, ServerConfig};
pub use error::BridgeError;
pub use handle::RuntimeHandle;
pub use ops::{
    Accumulator, AsyncLazy, AsyncValue, LazyCompute, LazySelf, MapOutput, Mapper, NonEmptyIter,
    Operators, Rejection, Service,
};
pub use value::{Entry, Value};
pub use view::HostValue;
