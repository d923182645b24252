//! Per-run coroutine driver.
//!
//! A [`Process`] owns one workflow coroutine and advances it exactly one
//! poll per driving step, triggered by inbound host messages. There is no
//! background execution: between steps the coroutine is inert, and the
//! sequence of delivered responses alone defines its progress.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use async_trait::async_trait;
use tracing::debug;

use crate::{Failure, Payload, Response, WorkflowContext};

pub mod registry;

/// Trait implemented by workflow declarations the driver can invoke.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, Failure>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, Failure>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, Failure>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, Failure> {
        (self.0)(ctx, input).await
    }
}

/// Observable lifecycle of a process. `Suspended` covers every live point
/// between driving steps; the driver is only transiently "running" inside
/// `start`/`next`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    NotStarted,
    Suspended,
    Completed { output: Payload },
    Failed { failure: Failure },
    ContinuedAsNew,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed { .. }
                | ProcessStatus::Failed { .. }
                | ProcessStatus::ContinuedAsNew
        )
    }
}

type Coroutine = Pin<Box<dyn Future<Output = Result<Payload, Failure>> + Send>>;

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

pub(crate) fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    // Safety: the future is never moved out of its storage between polls.
    let pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.poll(&mut cx)
}

/// Coroutine driver for one workflow run.
pub struct Process {
    ctx: WorkflowContext,
    handler: Arc<dyn WorkflowHandler>,
    coroutine: Mutex<Option<Coroutine>>,
    status: Mutex<ProcessStatus>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("run_id", &self.ctx.run_id())
            .field("status", &self.status())
            .finish()
    }
}

impl Process {
    pub fn new(ctx: WorkflowContext, handler: Arc<dyn WorkflowHandler>) -> Self {
        Self {
            ctx,
            handler,
            coroutine: Mutex::new(None),
            status: Mutex::new(ProcessStatus::NotStarted),
        }
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    pub fn status(&self) -> ProcessStatus {
        self.status.lock().expect("process status lock poisoned").clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Number of requests still awaiting a host response.
    pub fn pending_requests(&self) -> usize {
        self.ctx.lock().client.pending_len()
    }

    /// Host-controlled replay flag, consulted by `side_effect` and the
    /// replay-gated log macros.
    pub fn set_replaying(&self, replaying: bool) {
        self.ctx.set_replaying(replaying);
    }

    /// Build the coroutine from the declaration and run the first driving
    /// step. A body that completes without suspending goes terminal here.
    /// Calling `start` twice is a host/SDK desynchronization and panics.
    pub fn start(&self, input: Payload) {
        {
            let mut status = self.status.lock().expect("process status lock poisoned");
            if !matches!(*status, ProcessStatus::NotStarted) {
                panic!("start() called twice on workflow process");
            }
            *status = ProcessStatus::Suspended;
        }
        let ctx = self.ctx.clone();
        let handler = self.handler.clone();
        let coroutine: Coroutine = Box::pin(async move { handler.invoke(ctx, input).await });
        *self.coroutine.lock().expect("process coroutine lock poisoned") = Some(coroutine);
        debug!(run_id = %self.ctx.run_id(), "workflow process started");
        self.step();
    }

    /// One driving step. Only valid while the coroutine is alive.
    pub fn next(&self) {
        match self.status() {
            ProcessStatus::Suspended => self.step(),
            ProcessStatus::NotStarted => panic!("next() called before start()"),
            _ => panic!("next() called on a terminal workflow process"),
        }
    }

    /// Settle the pending completion for one host response, then drive.
    /// Responses for unknown ids settle nothing and are tolerated silently,
    /// including after the run has gone terminal.
    pub fn dispatch(&self, response: Response) {
        self.settle(response);
        if matches!(self.status(), ProcessStatus::Suspended) {
            self.step();
        }
    }

    /// Settle a batch of responses, then drive once.
    pub fn dispatch_batch(&self, responses: Vec<Response>) {
        for response in responses {
            self.settle(response);
        }
        if matches!(self.status(), ProcessStatus::Suspended) {
            self.step();
        }
    }

    fn settle(&self, response: Response) {
        let mut inner = self.ctx.lock();
        match response.failure {
            Some(failure) => {
                inner.client.reject(response.id, failure);
            }
            None => {
                inner
                    .client
                    .resolve(response.id, response.result.unwrap_or(Payload::Null));
            }
        }
    }

    /// Invoke a registered signal handler, then drive so that predicates
    /// observing the mutated state are re-evaluated.
    pub fn signal(&self, name: &str, args: Vec<Payload>) -> Result<(), String> {
        let handler = self
            .ctx
            .signal_handler(name)
            .ok_or_else(|| format!("unregistered signal handler: {name}"))?;
        handler(args);
        if matches!(self.status(), ProcessStatus::Suspended) {
            self.step();
        }
        Ok(())
    }

    /// Invoke a registered query handler. Read-only: no driving step.
    pub fn query(&self, name: &str, args: Vec<Payload>) -> Result<Payload, String> {
        let handler = self
            .ctx
            .query_handler(name)
            .ok_or_else(|| format!("unregistered query handler: {name}"))?;
        handler(args)
    }

    /// Invoke a registered update handler, drive, and return its value.
    pub fn update(&self, name: &str, args: Vec<Payload>) -> Result<Payload, String> {
        let handler = self
            .ctx
            .update_handler(name)
            .ok_or_else(|| format!("unregistered update handler: {name}"))?;
        let result = handler(args);
        if matches!(self.status(), ProcessStatus::Suspended) {
            self.step();
        }
        result
    }

    /// The single driving loop: evaluate predicates, poll once, and keep
    /// stepping only while predicate evaluation settles something new, so
    /// already-resolved work drains without another host round trip.
    fn step(&self) {
        let mut guard = self.coroutine.lock().expect("process coroutine lock poisoned");
        if guard.is_none() {
            return;
        }
        self.ctx.run_ready_conditions();
        loop {
            let poll = poll_once(guard.as_mut().expect("coroutine present while stepping"));
            match poll {
                Poll::Ready(outcome) => {
                    *guard = None;
                    drop(guard);
                    self.finish(outcome);
                    return;
                }
                Poll::Pending => {}
            }
            if self.ctx.is_closing() {
                // A continue-as-new was issued; retire the run without
                // letting the dropped coroutine record spurious cancels.
                self.ctx.begin_teardown();
                *guard = None;
                *self.status.lock().expect("process status lock poisoned") =
                    ProcessStatus::ContinuedAsNew;
                debug!(run_id = %self.ctx.run_id(), "workflow continued as new");
                return;
            }
            if self.ctx.run_ready_conditions() == 0 {
                return;
            }
        }
    }

    fn finish(&self, outcome: Result<Payload, Failure>) {
        // A body that issued continue-as-new and then returned closes the
        // run without a completion request.
        if self.ctx.is_closing() {
            *self.status.lock().expect("process status lock poisoned") =
                ProcessStatus::ContinuedAsNew;
            debug!(run_id = %self.ctx.run_id(), "workflow continued as new");
            return;
        }
        self.ctx.send_complete(&outcome);
        let status = match outcome {
            Ok(output) => {
                debug!(run_id = %self.ctx.run_id(), "workflow completed");
                ProcessStatus::Completed { output }
            }
            Err(failure) => {
                debug!(run_id = %self.ctx.run_id(), failure = %failure, "workflow failed");
                ProcessStatus::Failed { failure }
            }
        };
        *self.status.lock().expect("process status lock poisoned") = status;
    }

    /// Forced teardown for registry kill: drop the coroutine silently, then
    /// issue exactly one transport cancellation per outstanding request id.
    pub(crate) fn teardown(&self) -> Vec<u64> {
        self.ctx.begin_teardown();
        *self.coroutine.lock().expect("process coroutine lock poisoned") = None;
        let cancelled = self.ctx.cancel_all_outstanding();
        debug!(
            run_id = %self.ctx.run_id(),
            cancelled = cancelled.len(),
            "workflow process killed"
        );
        cancelled
    }
}
