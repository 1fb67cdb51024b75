//! In-process implementation of the foreign boundary.
//!
//! [`MemoryEngine`] plays the engine side of the contract so the bridge and
//! the protocol server can run without a compiled engine module: the runtime
//! thread uses it by default, and the tests drive every bridge path through
//! it.

mod engine;
mod heap;

pub use engine::{Delivery, MemoryEngine, DELIVERY_LOG_CAPACITY};
pub use heap::Heap;
