//! Pending call metadata and the boxed futures the driver polls.

use super::AsyncResult;
use crate::runtime::ops::{AsyncValue, Rejection};
use crate::runtime::value::Value;
use std::future::Future;
use std::pin::Pin;

/// Identity of an async-lazy call, captured as owned values before the
/// closure suspends.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub call_id: String,
    pub collection: String,
    pub key: Value,
    pub params: Value,
}

impl PendingCall {
    pub fn new(
        call_id: impl Into<String>,
        collection: impl Into<String>,
        key: Value,
        params: Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            collection: collection.into(),
            key,
            params,
        }
    }
}

/// A settled call with its result.
pub struct CompletedCall {
    pub call: PendingCall,
    pub result: AsyncResult,
}

/// Boxed future resolving to an [`AsyncResult`].
pub struct OpFuture {
    inner: Pin<Box<dyn Future<Output = AsyncResult> + 'static>>,
}

impl OpFuture {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = AsyncResult> + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    /// Wraps a user future, mapping its settlement.
    pub fn from_settlement<F>(future: F) -> Self
    where
        F: Future<Output = Result<AsyncValue, Rejection>> + 'static,
    {
        Self::new(async move { AsyncResult::from_settlement(future.await) })
    }
}

impl Future for OpFuture {
    type Output = AsyncResult;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}
