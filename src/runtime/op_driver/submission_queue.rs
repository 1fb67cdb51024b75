//! Queue for calls submitted but not yet handed to the poller.

use super::pending_op::{OpFuture, PendingCall};
use std::collections::VecDeque;

/// Entry in the submission queue.
pub struct QueuedCall {
    pub call: PendingCall,
    pub future: OpFuture,
}

impl QueuedCall {
    pub fn new(call: PendingCall, future: OpFuture) -> Self {
        Self { call, future }
    }
}

/// FIFO of submitted calls.
///
/// Submission happens inside foreign calls, where the poller's state may be
/// borrowed; calls wait here until the next poll moves them over.
#[derive(Default)]
pub struct SubmissionQueue {
    queue: VecDeque<QueuedCall>,
}

impl SubmissionQueue {
    pub fn push(&mut self, call: QueuedCall) {
        self.queue.push_back(call);
    }

    #[cfg(test)]
    pub fn pop(&mut self) -> Option<QueuedCall> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueuedCall> + '_ {
        self.queue.drain(..)
    }
}
