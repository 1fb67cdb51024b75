//! Error taxonomy shared by the bridge, the runtime thread and the server.

use thiserror::Error;

/// Recoverable failures surfaced by bridge operations.
///
/// Contract violations are not represented here: they abort through
/// [`contract_violation`] because they mean the boundary protocol itself was
/// broken.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// A write was attempted on a value view backed by a foreign buffer.
    #[error("value view is immutable; detach it to obtain an owned copy")]
    ImmutableValue,
    /// The value cannot be represented in the foreign memory space.
    #[error("unsupported value type: {0}")]
    UnsupportedValueType(String),
    /// The engine does not know the named collection.
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
    /// An async result could not be re-encoded or was refused by the engine.
    #[error("async delivery failed: {0}")]
    AsyncDelivery(String),
    /// Raised by a user closure.
    #[error("{0}")]
    User(String),
    /// Raised by the foreign engine.
    #[error("engine error: {0}")]
    Foreign(String),
    /// A value exceeded the configured depth or size limits.
    #[error("{0}")]
    LimitExceeded(String),
    /// The runtime thread is gone or refused the command.
    #[error("runtime error: {0}")]
    Runtime(String),
    /// A protocol request could not be decoded.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl BridgeError {
    pub fn user(message: impl Into<String>) -> Self {
        BridgeError::User(message.into())
    }
}

/// Aborts on a broken boundary contract (stale handle, wrong object kind,
/// bridge call without an active execution context).
#[track_caller]
pub fn contract_violation(message: impl std::fmt::Display) -> ! {
    tracing::error!("contract violation: {}", message);
    panic!("contract violation: {}", message)
}
