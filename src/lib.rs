//! Deterministic client-side workflow engine.
//!
//! Workflow bodies are ordinary `async` functions. The [`runtime::Process`]
//! driver advances a body exactly one poll at a time, triggered by inbound
//! host messages; the body suspends by awaiting handles issued through the
//! [`WorkflowContext`], and resumes when the host delivers the matching
//! [`Response`]. Progress is defined entirely by the ordered sequence of
//! delivered responses, never by wall-clock time, so replaying the same
//! responses against the same code reproduces the same outbound requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod codec;
pub mod futures;
mod logging;
pub mod runtime;
pub mod scope;
pub mod sync;

use crate::client::{CorrelatedClient, Transport};
use crate::futures::{
    new_slot, AnyFuture, CompletionFuture, ConditionFuture, JoinFuture, RaceFuture, Slot,
    TimeoutFuture, VersionFuture,
};
use crate::scope::{CancellationScope, ScopeNode};

pub use crate::codec::{Codec, Json};
pub use crate::futures::WaitCondition;
pub use crate::runtime::registry::{RunningWorkflows, WorkflowRegistry, WorkflowRegistryBuilder};
pub use crate::runtime::{FnWorkflow, Process, ProcessStatus, WorkflowHandler};
pub use crate::scope::ScopeHandle;
pub use crate::sync::WorkflowMutex;

/// Decoded payload value crossing the data-converter boundary.
pub type Payload = serde_json::Value;

/// Symbolic kind of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Timer,
    ExecuteActivity,
    StartChildWorkflow,
    SideEffect,
    GetVersion,
    SignalExternal,
    CompleteWorkflow,
    ContinueAsNew,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Timer => "Timer",
            RequestKind::ExecuteActivity => "ExecuteActivity",
            RequestKind::StartChildWorkflow => "StartChildWorkflow",
            RequestKind::SideEffect => "SideEffect",
            RequestKind::GetVersion => "GetVersion",
            RequestKind::SignalExternal => "SignalExternal",
            RequestKind::CompleteWorkflow => "CompleteWorkflow",
            RequestKind::ContinueAsNew => "ContinueAsNew",
        }
    }
}

/// Outbound, uniquely-identified unit of work requested by workflow code.
///
/// Immutable once created. Serializes to `{id, name, params, cancellable}`
/// at the transport boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(rename = "name")]
    pub kind: RequestKind,
    pub params: Vec<Payload>,
    pub cancellable: bool,
}

/// Inbound completion for a previously-issued [`Request`], routed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl Response {
    pub fn ok(id: u64, result: Payload) -> Self {
        Self {
            id,
            result: Some(result),
            failure: None,
        }
    }

    pub fn failed(id: u64, failure: Failure) -> Self {
        Self {
            id,
            result: None,
            failure: Some(failure),
        }
    }
}

/// Failure delivered at a suspension point.
///
/// `Cancelled` is the distinguished cooperative-cancellation outcome and is
/// expected to be caught; the other variants propagate like ordinary errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Failure {
    Cancelled { message: String },
    Application { error_type: String, message: String },
    Timeout { message: String },
}

impl Failure {
    pub fn cancelled(message: impl Into<String>) -> Self {
        Failure::Cancelled {
            message: message.into(),
        }
    }

    pub fn application(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Failure::Application {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Failure::Timeout {
            message: message.into(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Failure::Cancelled { .. })
    }

    pub fn display_message(&self) -> String {
        match self {
            Failure::Cancelled { message } => format!("cancelled: {message}"),
            Failure::Application { error_type, message } => format!("{error_type}: {message}"),
            Failure::Timeout { message } => format!("timeout: {message}"),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}

pub(crate) type SignalHandlerFn = Arc<dyn Fn(Vec<Payload>) + Send + Sync>;
pub(crate) type QueryHandlerFn = Arc<dyn Fn(Vec<Payload>) -> Result<Payload, String> + Send + Sync>;
pub(crate) type UpdateHandlerFn = Arc<dyn Fn(Vec<Payload>) -> Result<Payload, String> + Send + Sync>;

pub(crate) struct ConditionEntry {
    pub(crate) id: u64,
    pub(crate) predicate: Box<dyn Fn() -> bool + Send>,
    pub(crate) slot: Slot,
}

pub(crate) struct ContextInner {
    run_id: String,
    pub(crate) client: CorrelatedClient,
    pub(crate) conditions: Vec<ConditionEntry>,
    next_condition_id: u64,
    next_scope_id: u64,
    current_scope: Arc<ScopeNode>,
    replaying: bool,
    closing: bool,
    pub(crate) tearing_down: bool,
    signal_handlers: HashMap<String, SignalHandlerFn>,
    query_handlers: HashMap<String, QueryHandlerFn>,
    update_handlers: HashMap<String, UpdateHandlerFn>,
}

/// The façade workflow code calls into.
///
/// Cheap to clone; every operation funnels through the correlated request
/// client and returns an awaitable the driver can suspend on. The context is
/// threaded explicitly into the workflow body rather than held in ambient
/// process-wide state, so there is no current-context pointer to leak.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) inner: Arc<Mutex<ContextInner>>,
}

impl WorkflowContext {
    pub fn new(run_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let root = ScopeNode::root();
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                run_id: run_id.into(),
                client: CorrelatedClient::new(transport),
                conditions: Vec::new(),
                next_condition_id: 1,
                next_scope_id: 1,
                current_scope: root,
                replaying: false,
                closing: false,
                tearing_down: false,
                signal_handlers: HashMap::new(),
                query_handlers: HashMap::new(),
                update_handlers: HashMap::new(),
            })),
        }
    }

    pub fn run_id(&self) -> String {
        self.lock().run_id.clone()
    }

    /// True while the host is feeding back previously-recorded responses.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    // ---- request-issuing operations ----

    /// Timer driven by the logical clock; resolves when the host dispatches
    /// the matching response, never by local wall-clock time.
    pub fn timer(&self, delay_ms: u64) -> CompletionFuture {
        self.send_request(RequestKind::Timer, vec![Payload::from(delay_ms)], true)
    }

    pub fn execute_activity(&self, name: &str, args: Vec<Payload>) -> CompletionFuture {
        let mut params = vec![Payload::from(name)];
        params.extend(args);
        self.send_request(RequestKind::ExecuteActivity, params, true)
    }

    /// Typed activity call: encodes the input and decodes the result through
    /// the JSON codec.
    pub fn execute_activity_typed<In, Out>(
        &self,
        name: &str,
        input: &In,
    ) -> impl std::future::Future<Output = Result<Out, Failure>> + Send
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned + Send,
    {
        let fut = match codec::Json::encode(input) {
            Ok(payload) => Ok(self.execute_activity(name, vec![payload])),
            Err(e) => Err(Failure::application("EncodeError", e)),
        };
        async move {
            let value = fut?.await?;
            codec::Json::decode(&value).map_err(|e| Failure::application("DecodeError", e))
        }
    }

    pub fn execute_child_workflow(&self, name: &str, args: Vec<Payload>) -> CompletionFuture {
        let mut params = vec![Payload::from(name)];
        params.extend(args);
        self.send_request(RequestKind::StartChildWorkflow, params, true)
    }

    pub fn execute_child_workflow_typed<In, Out>(
        &self,
        name: &str,
        input: &In,
    ) -> impl std::future::Future<Output = Result<Out, Failure>> + Send
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned + Send,
    {
        let fut = match codec::Json::encode(input) {
            Ok(payload) => Ok(self.execute_child_workflow(name, vec![payload])),
            Err(e) => Err(Failure::application("EncodeError", e)),
        };
        async move {
            let value = fut?.await?;
            codec::Json::decode(&value).map_err(|e| Failure::application("DecodeError", e))
        }
    }

    /// Send a signal to another running workflow. Resolves once the host has
    /// accepted the delivery.
    pub fn signal_external(
        &self,
        target_run_id: &str,
        name: &str,
        args: Vec<Payload>,
    ) -> CompletionFuture {
        let mut params = vec![Payload::from(target_run_id), Payload::from(name)];
        params.extend(args);
        self.send_request(RequestKind::SignalExternal, params, false)
    }

    /// Record-once wrapper for non-deterministic code.
    ///
    /// When replaying, `f` is not invoked; the previously-recorded value is
    /// delivered by the host through the standard response path. On first
    /// execution `f` runs exactly once, its value rides on the request for
    /// the host to record, and the returned future is already resolved. A
    /// failing `f` short-circuits to a rejected future without issuing any
    /// request.
    pub fn side_effect<F>(&self, f: F) -> CompletionFuture
    where
        F: FnOnce() -> Result<Payload, String>,
    {
        if self.is_replaying() {
            return self.send_request(RequestKind::SideEffect, Vec::new(), false);
        }
        match f() {
            Ok(value) => {
                let fut = self.send_request(RequestKind::SideEffect, vec![value.clone()], false);
                self.lock().client.resolve(fut.request_id(), value);
                fut
            }
            Err(e) => {
                CompletionFuture::rejected(self.clone(), Failure::application("SideEffectError", e))
            }
        }
    }

    pub fn side_effect_typed<T, F>(
        &self,
        f: F,
    ) -> impl std::future::Future<Output = Result<T, Failure>> + Send
    where
        T: Serialize + serde::de::DeserializeOwned + Send,
        F: FnOnce() -> Result<T, String>,
    {
        let fut = self.side_effect(|| f().and_then(|v| codec::Json::encode(&v)));
        async move {
            let value = fut.await?;
            codec::Json::decode(&value).map_err(|e| Failure::application("DecodeError", e))
        }
    }

    /// Version marker for backward-compatible workflow-code migration.
    /// Resolves to the integer version the host pinned for `change_id`.
    pub fn get_version(
        &self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> VersionFuture {
        let fut = self.send_request(
            RequestKind::GetVersion,
            vec![
                Payload::from(change_id),
                Payload::from(min_supported),
                Payload::from(max_supported),
            ],
            false,
        );
        VersionFuture::new(fut)
    }

    /// Terminal request asking the host to start a fresh run with new input
    /// instead of ending the execution graph. The returned future never
    /// resolves; the driver retires the run at its next step.
    pub fn continue_as_new(&self, workflow_type: &str, input: Payload) -> CompletionFuture {
        let mut inner = self.lock();
        if inner.closing {
            panic!("workflow run is closing; no further requests may be issued");
        }
        let id = inner.client.send_fire_and_forget(
            RequestKind::ContinueAsNew,
            vec![Payload::from(workflow_type), input],
        );
        inner.closing = true;
        drop(inner);
        CompletionFuture::never(self.clone(), id)
    }

    // ---- await/condition primitives ----

    /// Suspend until `predicate` returns true. The driver evaluates pending
    /// predicates once per step, in registration order.
    pub fn wait_for<P>(&self, predicate: P) -> ConditionFuture
    where
        P: Fn() -> bool + Send + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_condition_id;
        inner.next_condition_id += 1;
        let slot = new_slot();
        inner.conditions.push(ConditionEntry {
            id,
            predicate: Box::new(predicate),
            slot: slot.clone(),
        });
        drop(inner);
        ConditionFuture::new(self.clone(), id, slot)
    }

    /// Race any number of conditions; resolves to the index of the first one
    /// to settle. A caller holding a single awaitable should just await it.
    pub fn await_any(&self, conditions: Vec<WaitCondition>) -> AnyFuture {
        AnyFuture::new(self, conditions)
    }

    /// Race `conditions` against a timer request. Resolves `false` if the
    /// timer fires first, `true` otherwise.
    pub fn await_with_timeout(
        &self,
        delay_ms: u64,
        conditions: Vec<WaitCondition>,
    ) -> TimeoutFuture {
        let timer = self.timer(delay_ms);
        TimeoutFuture::new(self, conditions, timer)
    }

    /// First-settled-wins race over completion futures, yielding the winner
    /// index and its outcome. Losers record a cancel on drop.
    pub fn race(&self, futures: Vec<CompletionFuture>) -> RaceFuture {
        RaceFuture::new(futures)
    }

    /// Await all completion futures, yielding outcomes in argument order.
    pub fn join(&self, futures: Vec<CompletionFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    // ---- cancellation scopes ----

    pub fn new_cancellation_scope<F, Fut>(&self, body: F) -> CancellationScope
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: std::future::Future<Output = Result<Payload, Failure>> + Send + 'static,
    {
        self.make_scope(body, false)
    }

    /// Scope excluded from parent cancellation, but independently cancellable.
    pub fn new_detached_scope<F, Fut>(&self, body: F) -> CancellationScope
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: std::future::Future<Output = Result<Payload, Failure>> + Send + 'static,
    {
        self.make_scope(body, true)
    }

    fn make_scope<F, Fut>(&self, body: F, detached: bool) -> CancellationScope
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: std::future::Future<Output = Result<Payload, Failure>> + Send + 'static,
    {
        let node = {
            let mut inner = self.lock();
            let id = inner.next_scope_id;
            inner.next_scope_id += 1;
            ScopeNode::child(&inner.current_scope, id, detached)
        };
        let fut = body(self.clone());
        CancellationScope::new(self.clone(), node, Box::pin(fut))
    }

    // ---- handler registration (inbound signal/query/update dispatch) ----

    pub fn register_signal<F>(&self, name: &str, f: F)
    where
        F: Fn(Vec<Payload>) + Send + Sync + 'static,
    {
        self.lock().signal_handlers.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_query<F>(&self, name: &str, f: F)
    where
        F: Fn(Vec<Payload>) -> Result<Payload, String> + Send + Sync + 'static,
    {
        self.lock().query_handlers.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_update<F>(&self, name: &str, f: F)
    where
        F: Fn(Vec<Payload>) -> Result<Payload, String> + Send + Sync + 'static,
    {
        self.lock().update_handlers.insert(name.to_string(), Arc::new(f));
    }

    // ---- crate-internal plumbing ----

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, ContextInner> {
        self.inner.lock().expect("workflow context lock poisoned")
    }

    pub(crate) fn send_request(
        &self,
        kind: RequestKind,
        params: Vec<Payload>,
        cancellable: bool,
    ) -> CompletionFuture {
        let mut inner = self.lock();
        if inner.closing {
            panic!("workflow run is closing; no further requests may be issued");
        }
        let scope = inner.current_scope.id();
        let (id, slot) = inner.client.send(kind, params, cancellable, scope);
        drop(inner);
        CompletionFuture::new(self.clone(), id, slot)
    }

    /// Terminal completion request; success and failure converge on the same
    /// request kind, differing only in which param is populated.
    pub(crate) fn send_complete(&self, outcome: &Result<Payload, Failure>) {
        let mut inner = self.lock();
        if inner.closing {
            return;
        }
        let params = match outcome {
            Ok(value) => vec![value.clone(), Payload::Null],
            Err(failure) => vec![
                Payload::Null,
                serde_json::to_value(failure).unwrap_or(Payload::Null),
            ],
        };
        inner.client.send_fire_and_forget(RequestKind::CompleteWorkflow, params);
        inner.closing = true;
    }

    /// Evaluate pending predicates once, in registration order, settling the
    /// ones that currently hold. Returns how many fired.
    pub(crate) fn run_ready_conditions(&self) -> usize {
        // Predicates run without the context lock held so they can freely
        // read state shared with signal handlers.
        let mut entries = std::mem::take(&mut self.lock().conditions);
        let mut fired = 0usize;
        entries.retain(|entry| {
            if (entry.predicate)() {
                crate::futures::settle(&entry.slot, Ok(Payload::Null));
                fired += 1;
                false
            } else {
                true
            }
        });
        let mut inner = self.lock();
        let registered_meanwhile = std::mem::take(&mut inner.conditions);
        inner.conditions = entries;
        inner.conditions.extend(registered_meanwhile);
        fired
    }

    pub(crate) fn swap_current_scope(&self, node: Arc<ScopeNode>) -> Arc<ScopeNode> {
        std::mem::replace(&mut self.lock().current_scope, node)
    }

    pub(crate) fn cancel_scope_requests(&self, scope_ids: &[u64]) {
        self.lock().client.cancel_scopes(scope_ids);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.lock().closing
    }

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.lock().replaying = replaying;
    }

    /// Drop-path cleanup for an unconsumed request future. Records at most
    /// one transport cancel, and none at all during teardown.
    pub(crate) fn drop_request(&self, id: u64, slot: &Slot) {
        let Ok(mut inner) = self.inner.try_lock() else {
            return;
        };
        if inner.tearing_down {
            return;
        }
        if crate::futures::is_settled(slot) {
            return;
        }
        if let Some(cancellable) = inner.client.forget(id) {
            if cancellable {
                inner.client.notify_cancel(id);
            }
        }
    }

    pub(crate) fn drop_condition(&self, condition_id: u64) {
        let Ok(mut inner) = self.inner.try_lock() else {
            return;
        };
        if inner.tearing_down {
            return;
        }
        inner.conditions.retain(|entry| entry.id != condition_id);
    }

    /// Teardown for kill and continue-as-new: suppresses drop-path cancels
    /// before the coroutine (and every future it owns) is dropped.
    pub(crate) fn begin_teardown(&self) {
        self.lock().tearing_down = true;
    }

    pub(crate) fn cancel_all_outstanding(&self) -> Vec<u64> {
        self.lock().client.cancel_all()
    }

    pub(crate) fn signal_handler(&self, name: &str) -> Option<SignalHandlerFn> {
        self.lock().signal_handlers.get(name).cloned()
    }

    pub(crate) fn query_handler(&self, name: &str) -> Option<QueryHandlerFn> {
        self.lock().query_handlers.get(name).cloned()
    }

    pub(crate) fn update_handler(&self, name: &str) -> Option<UpdateHandlerFn> {
        self.lock().update_handlers.get(name).cloned()
    }
}
