//! Driver for async-lazy computations in flight.
//!
//! An async-lazy closure returns a future from inside a foreign call. The
//! future is queued here and only polled by the runtime thread's event loop,
//! so its settlement is always delivered back into the engine from a fresh
//! top-level call, never from within the frame that started it.

mod futures_unordered_driver;
mod pending_op;
mod submission_queue;

pub use futures_unordered_driver::FuturesUnorderedDriver;
pub use pending_op::PendingCall;
pub(crate) use pending_op::OpFuture;

use crate::runtime::ops::{AsyncValue, Rejection};
use crate::runtime::value::Value;
use indexmap::IndexMap;
use std::future::Future;
use std::task::{Context, Poll};

/// How an async-lazy computation settled.
#[derive(Clone, Debug, PartialEq)]
pub enum AsyncResult {
    /// The closure produced a payload.
    Success {
        payload: Value,
        metadata: Option<Value>,
    },
    /// The closure reported no new payload.
    Unchanged { metadata: Option<Value> },
    /// The future rejected.
    Failure { error: String },
}

impl AsyncResult {
    pub fn from_settlement(settlement: Result<AsyncValue, Rejection>) -> Self {
        match settlement {
            Ok(AsyncValue {
                payload: Some(payload),
                metadata,
            }) => AsyncResult::Success { payload, metadata },
            Ok(AsyncValue {
                payload: None,
                metadata,
            }) => AsyncResult::Unchanged { metadata },
            Err(rejection) => AsyncResult::Failure {
                error: rejection.message(),
            },
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            AsyncResult::Success { .. } => "success",
            AsyncResult::Unchanged { .. } => "unchanged",
            AsyncResult::Failure { .. } => "failure",
        }
    }

    /// Encoding handed to the engine:
    /// `{"status", "payload"?, "metadata"?, "error"?}`.
    pub fn to_value(&self) -> Value {
        let mut object = IndexMap::new();
        object.insert("status".to_string(), Value::from(self.status()));
        match self {
            AsyncResult::Success { payload, metadata } => {
                object.insert("payload".to_string(), payload.clone());
                if let Some(metadata) = metadata {
                    object.insert("metadata".to_string(), metadata.clone());
                }
            }
            AsyncResult::Unchanged { metadata } => {
                if let Some(metadata) = metadata {
                    object.insert("metadata".to_string(), metadata.clone());
                }
            }
            AsyncResult::Failure { error } => {
                object.insert("error".to_string(), Value::from(error.as_str()));
            }
        }
        Value::Object(object)
    }
}

/// Statistics about in-flight calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpInflightStats {
    /// Number of pending calls
    pub pending_count: usize,
    /// Total calls submitted
    pub total_submitted: usize,
    /// Total calls completed
    pub total_completed: usize,
}

/// Core trait for call drivers.
pub trait OpDriver: Default {
    /// Queues a call. Returns `false` once the driver has shut down.
    fn submit(&self, call: PendingCall, future: impl Future<Output = AsyncResult> + 'static)
        -> bool;

    /// Resolves with the next settled call.
    fn poll_ready(&self, cx: &mut Context) -> Poll<(PendingCall, AsyncResult)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops in-flight calls and refuses new ones.
    fn shutdown(&self);

    fn stats(&self) -> OpInflightStats;

    fn is_shutdown(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settlement_mapping() {
        let success = AsyncResult::from_settlement(Ok(AsyncValue::payload(Value::from(42))));
        assert_eq!(success.status(), "success");

        let with_meta = AsyncResult::from_settlement(Ok(AsyncValue {
            payload: None,
            metadata: Some(Value::from("etag-1")),
        }));
        assert_eq!(
            with_meta,
            AsyncResult::Unchanged {
                metadata: Some(Value::from("etag-1"))
            }
        );

        let failure = AsyncResult::from_settlement(Err(Rejection::Value(Value::from(json!({
            "code": 7
        })))));
        assert_eq!(
            failure,
            AsyncResult::Failure {
                error: r#"{"code":7}"#.to_string()
            }
        );
    }

    #[test]
    fn test_result_encoding() {
        let encoded = AsyncResult::Success {
            payload: Value::from(json!({"temp": 21})),
            metadata: None,
        }
        .to_value();
        assert_eq!(
            encoded.to_json().unwrap(),
            json!({"status": "success", "payload": {"temp": 21}})
        );

        let encoded = AsyncResult::Failure {
            error: "timeout".to_string(),
        }
        .to_value();
        assert_eq!(
            encoded.to_json().unwrap(),
            json!({"status": "failure", "error": "timeout"})
        );
    }

    #[test]
    fn test_op_inflight_stats_default() {
        let stats = OpInflightStats::default();
        assert_eq!(stats.pending_count, 0);
        assert_eq!(stats.total_submitted, 0);
        assert_eq!(stats.total_completed, 0);
    }
}
