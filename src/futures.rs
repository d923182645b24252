//! Awaitable handles over completion slots.
//!
//! Every handle implements `std::future::Future` directly and is polled only
//! by the per-run driver, one step at a time. Handles are fused: once a
//! value has been consumed, further polls return `Pending`. Dropping an
//! unconsumed request handle records a transport cancel, guarded by the
//! teardown flag so that retiring a run does not double-cancel.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use ::futures::future::FusedFuture;

use crate::{Failure, Payload, WorkflowContext};

/// Settlement slot shared between the correlated client and one handle.
pub(crate) type Slot = Arc<Mutex<Option<Result<Payload, Failure>>>>;

pub(crate) fn new_slot() -> Slot {
    Arc::new(Mutex::new(None))
}

/// First settlement wins; later settlements are ignored.
pub(crate) fn settle(slot: &Slot, outcome: Result<Payload, Failure>) {
    let mut guard = slot.lock().expect("completion slot lock poisoned");
    if guard.is_none() {
        *guard = Some(outcome);
    }
}

pub(crate) fn is_settled(slot: &Slot) -> bool {
    slot.lock().expect("completion slot lock poisoned").is_some()
}

/// Handle for one outstanding request. Resolves to the decoded result or
/// rejects with the failure delivered for that request id.
#[must_use = "futures do nothing unless awaited"]
pub struct CompletionFuture {
    ctx: WorkflowContext,
    id: u64,
    slot: Slot,
    consumed: Cell<bool>,
}

impl CompletionFuture {
    pub(crate) fn new(ctx: WorkflowContext, id: u64, slot: Slot) -> Self {
        Self {
            ctx,
            id,
            slot,
            consumed: Cell::new(false),
        }
    }

    /// Already-rejected handle; no request was issued for it.
    pub(crate) fn rejected(ctx: WorkflowContext, failure: Failure) -> Self {
        let slot = new_slot();
        settle(&slot, Err(failure));
        Self::new(ctx, 0, slot)
    }

    /// Handle that never resolves; the run is expected to be retired before
    /// anyone could observe a value.
    pub(crate) fn never(ctx: WorkflowContext, id: u64) -> Self {
        Self::new(ctx, id, new_slot())
    }

    pub fn request_id(&self) -> u64 {
        self.id
    }
}

impl Future for CompletionFuture {
    type Output = Result<Payload, Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.consumed.get() {
            return Poll::Pending;
        }
        let settled = self
            .slot
            .lock()
            .expect("completion slot lock poisoned")
            .clone();
        match settled {
            Some(outcome) => {
                self.consumed.set(true);
                Poll::Ready(outcome)
            }
            None => Poll::Pending,
        }
    }
}

impl FusedFuture for CompletionFuture {
    fn is_terminated(&self) -> bool {
        self.consumed.get()
    }
}

impl Drop for CompletionFuture {
    fn drop(&mut self) {
        if self.consumed.get() {
            return;
        }
        let ctx = self.ctx.clone();
        ctx.drop_request(self.id, &self.slot);
    }
}

/// Handle for a `get_version` request; resolves to the pinned integer
/// version for the change id.
#[must_use = "futures do nothing unless awaited"]
pub struct VersionFuture {
    inner: CompletionFuture,
}

impl VersionFuture {
    pub(crate) fn new(inner: CompletionFuture) -> Self {
        Self { inner }
    }
}

impl Future for VersionFuture {
    type Output = Result<i32, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().inner).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(
                value
                    .as_i64()
                    .map(|v| v as i32)
                    .ok_or_else(|| {
                        Failure::application("TypeError", "version response was not an integer")
                    }),
            ),
            Poll::Ready(Err(failure)) => Poll::Ready(Err(failure)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedFuture for VersionFuture {
    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}

/// Handle for a registered predicate. Resolves on the first driver step
/// where the predicate returns true.
#[must_use = "futures do nothing unless awaited"]
pub struct ConditionFuture {
    ctx: WorkflowContext,
    condition_id: u64,
    slot: Slot,
    consumed: Cell<bool>,
}

impl ConditionFuture {
    pub(crate) fn new(ctx: WorkflowContext, condition_id: u64, slot: Slot) -> Self {
        Self {
            ctx,
            condition_id,
            slot,
            consumed: Cell::new(false),
        }
    }
}

impl Future for ConditionFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.consumed.get() {
            return Poll::Pending;
        }
        if is_settled(&self.slot) {
            self.consumed.set(true);
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl FusedFuture for ConditionFuture {
    fn is_terminated(&self) -> bool {
        self.consumed.get()
    }
}

impl Drop for ConditionFuture {
    fn drop(&mut self) {
        if self.consumed.get() || is_settled(&self.slot) {
            return;
        }
        let ctx = self.ctx.clone();
        ctx.drop_condition(self.condition_id);
    }
}

/// One leg of an `await_any` / `await_with_timeout` race: either an
/// already-awaitable request handle or a zero-argument predicate.
pub enum WaitCondition {
    Future(CompletionFuture),
    Predicate(Box<dyn Fn() -> bool + Send + 'static>),
}

impl WaitCondition {
    pub fn predicate<P>(p: P) -> Self
    where
        P: Fn() -> bool + Send + 'static,
    {
        WaitCondition::Predicate(Box::new(p))
    }
}

impl From<CompletionFuture> for WaitCondition {
    fn from(fut: CompletionFuture) -> Self {
        WaitCondition::Future(fut)
    }
}

enum WaitItem {
    Future(CompletionFuture),
    Condition(ConditionFuture),
}

impl WaitItem {
    fn poll_settled(&mut self, cx: &mut Context<'_>) -> bool {
        match self {
            WaitItem::Future(f) => Pin::new(f).poll(cx).is_ready(),
            WaitItem::Condition(c) => Pin::new(c).poll(cx).is_ready(),
        }
    }
}

fn into_items(ctx: &WorkflowContext, conditions: Vec<WaitCondition>) -> Vec<WaitItem> {
    conditions
        .into_iter()
        .map(|cond| match cond {
            WaitCondition::Future(f) => WaitItem::Future(f),
            WaitCondition::Predicate(p) => WaitItem::Condition(ctx.wait_for(move || p())),
        })
        .collect()
}

/// First-settled-wins race over mixed conditions; resolves to the index of
/// the winner. Items are polled in the order they were supplied, so the
/// winner of a same-step tie is the earliest-listed condition.
#[must_use = "futures do nothing unless awaited"]
pub struct AnyFuture {
    items: Vec<WaitItem>,
    done: bool,
}

impl AnyFuture {
    pub(crate) fn new(ctx: &WorkflowContext, conditions: Vec<WaitCondition>) -> Self {
        debug_assert!(!conditions.is_empty(), "await_any requires at least one condition");
        Self {
            items: into_items(ctx, conditions),
            done: false,
        }
    }
}

impl Future for AnyFuture {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        for (i, item) in this.items.iter_mut().enumerate() {
            if item.poll_settled(cx) {
                this.done = true;
                return Poll::Ready(i);
            }
        }
        Poll::Pending
    }
}

impl FusedFuture for AnyFuture {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

/// Race over request handles, yielding the winner index and its outcome.
/// Losers stay live until the race future is dropped, at which point any
/// unconsumed cancellable request records a transport cancel.
#[must_use = "futures do nothing unless awaited"]
pub struct RaceFuture {
    children: Vec<CompletionFuture>,
    done: bool,
}

impl RaceFuture {
    pub(crate) fn new(children: Vec<CompletionFuture>) -> Self {
        debug_assert!(!children.is_empty(), "race requires at least one future");
        Self {
            children,
            done: false,
        }
    }
}

impl Future for RaceFuture {
    type Output = (usize, Result<Payload, Failure>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        for (i, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready(outcome) = Pin::new(child).poll(cx) {
                this.done = true;
                return Poll::Ready((i, outcome));
            }
        }
        Poll::Pending
    }
}

impl FusedFuture for RaceFuture {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

/// Await every request handle; outcomes are yielded in argument order.
#[must_use = "futures do nothing unless awaited"]
pub struct JoinFuture {
    children: Vec<CompletionFuture>,
    results: Vec<Option<Result<Payload, Failure>>>,
    done: bool,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<CompletionFuture>) -> Self {
        let results = children.iter().map(|_| None).collect();
        Self {
            children,
            results,
            done: false,
        }
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<Payload, Failure>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        for (i, child) in this.children.iter_mut().enumerate() {
            if this.results[i].is_none() {
                if let Poll::Ready(outcome) = Pin::new(child).poll(cx) {
                    this.results[i] = Some(outcome);
                }
            }
        }
        if this.results.iter().all(|r| r.is_some()) {
            this.done = true;
            let outcomes = this.results.iter_mut().map(|r| r.take().unwrap()).collect();
            Poll::Ready(outcomes)
        } else {
            Poll::Pending
        }
    }
}

impl FusedFuture for JoinFuture {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

/// Race between a set of conditions and a timer request. Resolves `false`
/// when the timer wins, `true` otherwise. Conditions are checked before the
/// timer on every step, and the losing timer may still settle later with no
/// observable effect.
#[must_use = "futures do nothing unless awaited"]
pub struct TimeoutFuture {
    items: Vec<WaitItem>,
    timer: CompletionFuture,
    done: bool,
}

impl TimeoutFuture {
    pub(crate) fn new(
        ctx: &WorkflowContext,
        conditions: Vec<WaitCondition>,
        timer: CompletionFuture,
    ) -> Self {
        Self {
            items: into_items(ctx, conditions),
            timer,
            done: false,
        }
    }
}

impl Future for TimeoutFuture {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        for item in this.items.iter_mut() {
            if item.poll_settled(cx) {
                this.done = true;
                return Poll::Ready(true);
            }
        }
        if Pin::new(&mut this.timer).poll(cx).is_ready() {
            this.done = true;
            return Poll::Ready(false);
        }
        Poll::Pending
    }
}

impl FusedFuture for TimeoutFuture {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

// The driver projects freely into these handles; they must stay Unpin.
const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<CompletionFuture>();
    assert_unpin::<ConditionFuture>();
    assert_unpin::<VersionFuture>();
    assert_unpin::<AnyFuture>();
    assert_unpin::<RaceFuture>();
    assert_unpin::<JoinFuture>();
    assert_unpin::<TimeoutFuture>();
};
