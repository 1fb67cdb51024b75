//! Stack of active foreign execution contexts.
//!
//! The engine calls into the host with the context of the recomputation it
//! is running, and host closures may call back into the engine, which may
//! call the host again. The stack records which context is current at every
//! level. Entries are pushed by [`ContextStack::enter`] and popped when the
//! returned guard drops, so early returns and unwinding restore the previous
//! depth.

use crate::runtime::error::contract_violation;
use crate::runtime::foreign::ExecutionContext;
use std::cell::RefCell;

#[derive(Debug, Default)]
pub struct ContextStack {
    stack: RefCell<Vec<ExecutionContext>>,
}

/// Pops its context on drop.
#[must_use = "the context is popped as soon as the guard is dropped"]
pub struct ContextGuard<'s> {
    stack: &'s ContextStack,
    depth: usize,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, ctx: ExecutionContext) -> ContextGuard<'_> {
        let mut stack = self.stack.borrow_mut();
        stack.push(ctx);
        ContextGuard {
            stack: self,
            depth: stack.len(),
        }
    }

    pub fn current(&self) -> Option<ExecutionContext> {
        self.stack.borrow().last().copied()
    }

    /// The current context; an empty stack is a contract violation.
    pub fn require_current(&self) -> ExecutionContext {
        match self.current() {
            Some(ctx) => ctx,
            None => contract_violation("bridge call outside of any execution context"),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let mut stack = self.stack.stack.borrow_mut();
        if stack.len() != self.depth {
            // Guards dropped out of order; the ordering is already lost.
            tracing::error!(
                "execution context stack unbalanced: expected depth {}, found {}",
                self.depth,
                stack.len()
            );
        }
        stack.truncate(self.depth - 1);
    }
}
