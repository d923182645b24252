//! Workflow declaration registry and the process-wide running-run map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{FnWorkflow, Process, WorkflowHandler};
use crate::client::Transport;
use crate::codec::{Codec, Json};
use crate::{Failure, Payload, Response, WorkflowContext};

/// Immutable registry mapping workflow type names to declaration handlers.
pub struct WorkflowRegistry {
    inner: Arc<HashMap<String, Arc<dyn WorkflowHandler>>>,
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("names", &self.list_names())
            .finish()
    }
}

impl Clone for WorkflowRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        let handler = self.inner.get(name).cloned();
        if handler.is_none() {
            debug!(
                requested_name = %name,
                registered_names = ?self.list_names(),
                "workflow registry lookup miss"
            );
        }
        handler
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<dyn WorkflowHandler>>,
    errors: Vec<String>,
}

impl WorkflowRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, Failure>> + Send + 'static,
    {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate workflow registration: {name}"));
            return self;
        }
        self.map.insert(name, Arc::new(FnWorkflow(f)));
        self
    }

    /// Typed registration: input decoded and output encoded through the
    /// JSON codec; a malformed input fails the run with a decode failure.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, Failure>> + Send + 'static,
    {
        let wrapper = move |ctx: WorkflowContext, input: Payload| {
            let f_inner = f.clone();
            async move {
                let decoded: In =
                    Json::decode(&input).map_err(|e| Failure::application("DecodeError", e))?;
                let out: Out = f_inner(ctx, decoded).await?;
                Json::encode(&out).map_err(|e| Failure::application("EncodeError", e))
            }
        };
        self.register(name, wrapper)
    }

    pub fn register_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn WorkflowHandler>,
    ) -> Self {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate workflow registration: {name}"));
            return self;
        }
        self.map.insert(name, handler);
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build, surfacing any duplicate-registration errors.
    pub fn build_result(self) -> Result<WorkflowRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

/// Process-wide map from run identifier to its live [`Process`].
///
/// Entries live exactly as long as the run is active on this worker: created
/// on start, removed when a dispatch drives the run terminal or the run is
/// killed. Not a cache.
#[derive(Default)]
pub struct RunningWorkflows {
    processes: Mutex<HashMap<String, Arc<Process>>>,
}

impl RunningWorkflows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, index, and start a process for a run. A duplicate run id
    /// means the host and SDK have diverged and panics.
    pub fn run(
        &self,
        run_id: &str,
        declaration: Arc<dyn WorkflowHandler>,
        transport: Arc<dyn Transport>,
        input: Payload,
    ) -> Arc<Process> {
        let ctx = WorkflowContext::new(run_id, transport);
        let process = Arc::new(Process::new(ctx, declaration));
        {
            let mut map = self.lock();
            if map.contains_key(run_id) {
                panic!("run id already registered: {run_id}");
            }
            map.insert(run_id.to_string(), process.clone());
        }
        process.start(input);
        self.reap_if_terminal(run_id, &process);
        process
    }

    /// Resolve a declaration by name and start it.
    pub fn start_from(
        &self,
        registry: &WorkflowRegistry,
        name: &str,
        run_id: &str,
        transport: Arc<dyn Transport>,
        input: Payload,
    ) -> Result<Arc<Process>, String> {
        let declaration = registry
            .resolve(name)
            .ok_or_else(|| format!("unregistered workflow: {name}"))?;
        Ok(self.run(run_id, declaration, transport, input))
    }

    pub fn find(&self, run_id: &str) -> Option<Arc<Process>> {
        self.lock().get(run_id).cloned()
    }

    /// Route one host response to its run and drive; drops the registry
    /// entry once the run goes terminal.
    pub fn dispatch(&self, run_id: &str, response: Response) -> Result<(), String> {
        let process = self
            .find(run_id)
            .ok_or_else(|| format!("process not found for run: {run_id}"))?;
        process.dispatch(response);
        self.reap_if_terminal(run_id, &process);
        Ok(())
    }

    pub fn dispatch_batch(&self, run_id: &str, responses: Vec<Response>) -> Result<(), String> {
        let process = self
            .find(run_id)
            .ok_or_else(|| format!("process not found for run: {run_id}"))?;
        process.dispatch_batch(responses);
        self.reap_if_terminal(run_id, &process);
        Ok(())
    }

    pub fn signal(&self, run_id: &str, name: &str, args: Vec<Payload>) -> Result<(), String> {
        let process = self
            .find(run_id)
            .ok_or_else(|| format!("process not found for run: {run_id}"))?;
        process.signal(name, args)?;
        self.reap_if_terminal(run_id, &process);
        Ok(())
    }

    pub fn query(&self, run_id: &str, name: &str, args: Vec<Payload>) -> Result<Payload, String> {
        let process = self
            .find(run_id)
            .ok_or_else(|| format!("process not found for run: {run_id}"))?;
        process.query(name, args)
    }

    pub fn update(&self, run_id: &str, name: &str, args: Vec<Payload>) -> Result<Payload, String> {
        let process = self
            .find(run_id)
            .ok_or_else(|| format!("process not found for run: {run_id}"))?;
        let result = process.update(name, args);
        self.reap_if_terminal(run_id, &process);
        result
    }

    /// Forced teardown. An unknown run id means the host and SDK have
    /// diverged; that is fatal, not retried. Returns the request ids whose
    /// in-flight operations were cancelled at the transport.
    pub fn kill(&self, run_id: &str) -> Vec<u64> {
        let process = self
            .lock()
            .remove(run_id)
            .unwrap_or_else(|| panic!("process not found for run: {run_id}"));
        process.teardown()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Process>>> {
        self.processes.lock().expect("running workflows lock poisoned")
    }

    fn reap_if_terminal(&self, run_id: &str, process: &Arc<Process>) {
        if process.is_terminal() {
            self.lock().remove(run_id);
            debug!(run_id, "run retired from registry");
        }
    }
}
