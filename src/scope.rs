//! Hierarchical cooperative cancellation.
//!
//! Scopes form a tree rooted at the run's top-level scope. Cancelling a
//! scope marks it and every non-detached descendant, fires `on_cancel`
//! callbacks innermost-first before the cancel call returns, and rejects the
//! subtree's outstanding requests. The coroutine suspended inside a
//! cancelled scope observes the cancellation failure at its next resumption
//! point, never through out-of-band interruption.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use crate::{Failure, Payload, WorkflowContext};

type OnCancelFn = Box<dyn FnMut() + Send>;
type ScopeBody = Pin<Box<dyn Future<Output = Result<Payload, Failure>> + Send>>;

pub(crate) struct ScopeNode {
    id: u64,
    detached: bool,
    cancelled: AtomicBool,
    settled: AtomicBool,
    parent: Weak<ScopeNode>,
    children: Mutex<Vec<Arc<ScopeNode>>>,
    on_cancel: Mutex<Vec<OnCancelFn>>,
}

impl ScopeNode {
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Self {
            id: 0,
            detached: false,
            cancelled: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            on_cancel: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn child(parent: &Arc<ScopeNode>, id: u64, detached: bool) -> Arc<Self> {
        let node = Arc::new(Self {
            id,
            detached,
            cancelled: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            parent: Arc::downgrade(parent),
            children: Mutex::new(Vec::new()),
            on_cancel: Mutex::new(Vec::new()),
        });
        parent.children.lock().expect("scope tree lock poisoned").push(node.clone());
        node
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn add_on_cancel(&self, callback: OnCancelFn) {
        self.on_cancel.lock().expect("scope tree lock poisoned").push(callback);
    }

    /// Mark this scope and every non-detached descendant cancelled,
    /// depth-first, firing each affected scope's callbacks exactly once in
    /// registration order (innermost scopes first). Collects the ids of the
    /// newly-cancelled scopes. Settled or already-cancelled scopes are left
    /// untouched.
    pub(crate) fn cancel_subtree(self: &Arc<Self>, cancelled_ids: &mut Vec<u64>) {
        if self.settled.load(Ordering::SeqCst) || self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let children: Vec<Arc<ScopeNode>> = self
            .children
            .lock()
            .expect("scope tree lock poisoned")
            .clone();
        for child in children {
            if !child.detached {
                child.cancel_subtree(cancelled_ids);
            }
        }
        let mut callbacks =
            std::mem::take(&mut *self.on_cancel.lock().expect("scope tree lock poisoned"));
        for callback in callbacks.iter_mut() {
            callback();
        }
        cancelled_ids.push(self.id);
    }

    /// Scope outcome is decided; detach from the tree.
    pub(crate) fn mark_settled(self: &Arc<Self>) {
        self.settled.store(true, Ordering::SeqCst);
        if let Some(parent) = self.parent.upgrade() {
            parent
                .children
                .lock()
                .expect("scope tree lock poisoned")
                .retain(|child| child.id != self.id);
        }
    }
}

/// Clonable handle onto a scope, usable from signal handlers or sibling code
/// while the scope future itself is being awaited.
#[derive(Clone)]
pub struct ScopeHandle {
    ctx: WorkflowContext,
    node: Arc<ScopeNode>,
}

impl ScopeHandle {
    pub(crate) fn new(ctx: WorkflowContext, node: Arc<ScopeNode>) -> Self {
        Self { ctx, node }
    }

    pub fn is_detached(&self) -> bool {
        self.node.is_detached()
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.is_cancelled()
    }

    /// Register a cancellation callback. Registering on an already-cancelled
    /// scope invokes the callback immediately.
    pub fn on_cancel<F>(&self, callback: F) -> &Self
    where
        F: FnMut() + Send + 'static,
    {
        if self.node.is_cancelled() {
            let mut callback = callback;
            callback();
        } else {
            self.node.add_on_cancel(Box::new(callback));
        }
        self
    }

    /// Idempotent: cancelling a settled or already-cancelled scope has no
    /// observable effect.
    pub fn cancel(&self) {
        let mut cancelled_ids = Vec::new();
        self.node.cancel_subtree(&mut cancelled_ids);
        if !cancelled_ids.is_empty() {
            self.ctx.cancel_scope_requests(&cancelled_ids);
        }
    }
}

/// A unit of workflow code wrapped in its own cancellation scope.
///
/// The scope is itself a future: awaiting it runs the body until the body
/// settles or the scope is cancelled, whichever the driver observes first at
/// a resumption point.
#[must_use = "futures do nothing unless awaited"]
pub struct CancellationScope {
    ctx: WorkflowContext,
    node: Arc<ScopeNode>,
    body: Option<ScopeBody>,
    done: bool,
}

impl CancellationScope {
    pub(crate) fn new(ctx: WorkflowContext, node: Arc<ScopeNode>, body: ScopeBody) -> Self {
        Self {
            ctx,
            node,
            body: Some(body),
            done: false,
        }
    }

    pub fn handle(&self) -> ScopeHandle {
        ScopeHandle::new(self.ctx.clone(), self.node.clone())
    }

    pub fn is_detached(&self) -> bool {
        self.node.is_detached()
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.is_cancelled()
    }

    pub fn on_cancel<F>(&self, callback: F) -> &Self
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().on_cancel(callback);
        self
    }

    pub fn cancel(&self) {
        self.handle().cancel();
    }

    fn finish(&mut self) {
        self.done = true;
        self.node.mark_settled();
        // Dropping the body releases any futures it still owns; requests the
        // cancel path already rejected are skipped by their drop guards.
        self.body = None;
    }
}

impl Future for CancellationScope {
    type Output = Result<Payload, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        // Cancellation is delivered here, at the resumption point, instead
        // of interrupting the body mid-step.
        if this.node.is_cancelled() {
            this.finish();
            return Poll::Ready(Err(Failure::cancelled("scope cancelled")));
        }
        let prev = this.ctx.swap_current_scope(this.node.clone());
        let result = this
            .body
            .as_mut()
            .expect("scope body present while live")
            .as_mut()
            .poll(cx);
        this.ctx.swap_current_scope(prev);
        match result {
            Poll::Ready(outcome) => {
                this.finish();
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl ::futures::future::FusedFuture for CancellationScope {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_marks_non_detached_descendants_only() {
        let root = ScopeNode::root();
        let child = ScopeNode::child(&root, 1, false);
        let detached = ScopeNode::child(&root, 2, true);
        let grandchild = ScopeNode::child(&child, 3, false);

        let mut ids = Vec::new();
        root.cancel_subtree(&mut ids);

        assert!(root.is_cancelled());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!detached.is_cancelled());
        // Innermost scopes settle their callbacks first.
        assert_eq!(ids, vec![3, 1, 0]);
    }

    #[test]
    fn cancel_is_idempotent_and_fires_callbacks_once() {
        let root = ScopeNode::root();
        let counter = Arc::new(Mutex::new(0));
        let c = counter.clone();
        root.add_on_cancel(Box::new(move || *c.lock().unwrap() += 1));

        let mut ids = Vec::new();
        root.cancel_subtree(&mut ids);
        root.cancel_subtree(&mut ids);

        assert_eq!(*counter.lock().unwrap(), 1);
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn settled_scope_ignores_cancellation() {
        let root = ScopeNode::root();
        let child = ScopeNode::child(&root, 1, false);
        child.mark_settled();

        let mut ids = Vec::new();
        root.cancel_subtree(&mut ids);

        assert!(!child.is_cancelled());
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn settling_detaches_from_parent() {
        let root = ScopeNode::root();
        let child = ScopeNode::child(&root, 1, false);
        assert_eq!(root.children.lock().unwrap().len(), 1);
        child.mark_settled();
        assert!(root.children.lock().unwrap().is_empty());
    }
}
