//! FuturesUnordered-based OpDriver implementation.

use super::pending_op::{CompletedCall, OpFuture, PendingCall};
use super::submission_queue::{QueuedCall, SubmissionQueue};
use super::{AsyncResult, OpDriver, OpInflightStats};
use futures::stream::{FuturesUnordered, StreamExt};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Future tagged with the call it belongs to.
struct TaggedFuture {
    call: Option<PendingCall>,
    future: OpFuture,
}

impl Future for TaggedFuture {
    type Output = CompletedCall;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.future).poll(cx) {
            Poll::Ready(result) => match self.call.take() {
                Some(call) => Poll::Ready(CompletedCall { call, result }),
                None => Poll::Pending,
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Polls every in-flight call concurrently on the runtime thread.
///
/// Submission never polls: a future that is already complete still waits
/// for the event loop, which keeps delivery out of the submitting frame.
#[derive(Default)]
pub struct FuturesUnorderedDriver {
    queue: RefCell<SubmissionQueue>,
    futures: RefCell<FuturesUnordered<TaggedFuture>>,
    total_submitted: Cell<usize>,
    total_completed: Cell<usize>,
    shutdown: Cell<bool>,
}

impl FuturesUnorderedDriver {
    /// Transfer queued calls to FuturesUnordered
    fn drain_queue(&self) {
        let mut queue = self.queue.borrow_mut();
        let futures = self.futures.borrow_mut();

        for queued in queue.drain() {
            futures.push(TaggedFuture {
                call: Some(queued.call),
                future: queued.future,
            });
        }
    }
}

impl OpDriver for FuturesUnorderedDriver {
    fn submit(
        &self,
        call: PendingCall,
        future: impl Future<Output = AsyncResult> + 'static,
    ) -> bool {
        if self.shutdown.get() {
            tracing::warn!(
                "dropping async call {} submitted after shutdown",
                call.call_id
            );
            return false;
        }

        self.total_submitted.set(self.total_submitted.get() + 1);
        self.queue
            .borrow_mut()
            .push(QueuedCall::new(call, OpFuture::new(future)));
        true
    }

    fn poll_ready(&self, cx: &mut Context) -> Poll<(PendingCall, AsyncResult)> {
        if self.shutdown.get() {
            return Poll::Pending;
        }

        self.drain_queue();

        let mut futures = self.futures.borrow_mut();
        match futures.poll_next_unpin(cx) {
            Poll::Ready(Some(completed)) => {
                self.total_completed.set(self.total_completed.get() + 1);
                Poll::Ready((completed.call, completed.result))
            }
            // An empty set is woken again by the event loop on the next submit.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }

    fn len(&self) -> usize {
        self.queue.borrow().len() + self.futures.borrow().len()
    }

    fn shutdown(&self) {
        self.shutdown.set(true);
        self.queue.borrow_mut().clear();
        self.futures.borrow_mut().clear();
    }

    fn stats(&self) -> OpInflightStats {
        OpInflightStats {
            pending_count: self.len(),
            total_submitted: self.total_submitted.get(),
            total_completed: self.total_completed.get(),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Value;
    use futures::future::poll_fn;
    use std::future::ready;
    use tokio::sync::oneshot;

    fn call(id: &str) -> PendingCall {
        PendingCall::new(id, "c", Value::from(id), Value::Null)
    }

    fn unchanged() -> AsyncResult {
        AsyncResult::Unchanged { metadata: None }
    }

    #[test]
    fn test_submit_never_completes_eagerly() {
        let driver = FuturesUnorderedDriver::default();

        assert!(driver.submit(call("a"), ready(unchanged())));
        assert_eq!(driver.len(), 1);
        assert_eq!(driver.stats().total_completed, 0);
    }

    #[tokio::test]
    async fn test_poll_ready_yields_tagged_result() {
        let driver = FuturesUnorderedDriver::default();
        driver.submit(call("a"), ready(unchanged()));

        let (call, result) = poll_fn(|cx| driver.poll_ready(cx)).await;

        assert_eq!(call.call_id, "a");
        assert_eq!(result, unchanged());
        assert!(driver.is_empty());
        assert_eq!(driver.stats().total_completed, 1);
    }

    #[tokio::test]
    async fn test_completion_order_follows_settlement() {
        let driver = FuturesUnorderedDriver::default();
        let (first_tx, first_rx) = oneshot::channel::<()>();
        let (second_tx, second_rx) = oneshot::channel::<()>();

        driver.submit(call("first"), async move {
            let _ = first_rx.await;
            AsyncResult::Failure {
                error: "late".to_string(),
            }
        });
        driver.submit(call("second"), async move {
            let _ = second_rx.await;
            AsyncResult::Success {
                payload: Value::from(2),
                metadata: None,
            }
        });

        second_tx.send(()).unwrap();
        let (call_a, result_a) = poll_fn(|cx| driver.poll_ready(cx)).await;
        first_tx.send(()).unwrap();
        let (call_b, result_b) = poll_fn(|cx| driver.poll_ready(cx)).await;

        assert_eq!(call_a.call_id, "second");
        assert_eq!(result_a.status(), "success");
        assert_eq!(call_b.call_id, "first");
        assert_eq!(result_b.status(), "failure");
    }

    #[test]
    fn test_shutdown() {
        let driver = FuturesUnorderedDriver::default();
        driver.submit(call("a"), ready(unchanged()));

        driver.shutdown();

        assert!(driver.is_empty());
        assert!(driver.is_shutdown());
        assert!(!driver.submit(call("b"), ready(unchanged())));
        assert_eq!(driver.stats().total_submitted, 1);
    }

    #[test]
    fn test_stats() {
        let driver = FuturesUnorderedDriver::default();
        for id in ["a", "b", "c"] {
            driver.submit(call(id), ready(unchanged()));
        }

        let stats = driver.stats();
        assert_eq!(stats.total_submitted, 3);
        assert_eq!(stats.total_completed, 0);
        assert_eq!(stats.pending_count, 3);
    }
}
