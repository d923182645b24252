//! Correlated request client.
//!
//! Assigns every outbound request a monotonically-increasing id, registers a
//! pending completion for it, and pushes it across the transport boundary.
//! Inbound responses settle exactly the pending completion matching their id;
//! ids with no pending completion are tolerated silently, since the request
//! may have been cancelled or already settled.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::futures::{is_settled, new_slot, settle, Slot};
use crate::{Failure, Payload, Request, RequestKind};

/// Narrow host boundary. `send` is invoked from inside future polls and
/// context calls, so implementations must return promptly and must not call
/// back into the process.
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request);
    fn cancel(&self, id: u64);
}

/// Live binding between a request id and the completion slot the coroutine
/// is suspended on. At most one exists per outstanding id.
pub(crate) struct PendingCompletion {
    pub(crate) slot: Slot,
    pub(crate) cancellable: bool,
    pub(crate) scope: u64,
}

/// Ids wrap to 1 before reaching the integer maximum. The generator skips
/// ids that still have a pending completion, so an id is never reused while
/// its previous occupant is outstanding.
const REQUEST_ID_WRAP: u64 = u64::MAX - 1024;

pub(crate) struct CorrelatedClient {
    transport: Arc<dyn Transport>,
    next_id: u64,
    pending: HashMap<u64, PendingCompletion>,
}

impl CorrelatedClient {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= REQUEST_ID_WRAP { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return id;
            }
            debug!(id, "request id still outstanding after wraparound; skipping");
        }
    }

    /// Issue a request and register its pending completion, tagged with the
    /// cancellation scope that owns it.
    pub(crate) fn send(
        &mut self,
        kind: RequestKind,
        params: Vec<Payload>,
        cancellable: bool,
        scope: u64,
    ) -> (u64, Slot) {
        let id = self.allocate_id();
        let slot = new_slot();
        self.pending.insert(
            id,
            PendingCompletion {
                slot: slot.clone(),
                cancellable,
                scope,
            },
        );
        let request = Request {
            id,
            kind,
            params,
            cancellable,
        };
        self.transport.send(&request);
        (id, slot)
    }

    /// Issue a request that will never be resolved back into the run
    /// (terminal completion, continue-as-new). No pending completion is
    /// registered for it.
    pub(crate) fn send_fire_and_forget(&mut self, kind: RequestKind, params: Vec<Payload>) -> u64 {
        let id = self.allocate_id();
        let request = Request {
            id,
            kind,
            params,
            cancellable: false,
        };
        self.transport.send(&request);
        id
    }

    /// Settle the pending completion for `id` with a value. Unknown ids are
    /// a benign no-op. Returns whether a completion was settled.
    pub(crate) fn resolve(&mut self, id: u64, value: Payload) -> bool {
        match self.pending.remove(&id) {
            Some(pc) => {
                settle(&pc.slot, Ok(value));
                true
            }
            None => {
                debug!(id, "response for unknown request id; ignoring");
                false
            }
        }
    }

    /// Settle the pending completion for `id` with a failure. Unknown ids
    /// are a benign no-op. Returns whether a completion was settled.
    pub(crate) fn reject(&mut self, id: u64, failure: Failure) -> bool {
        match self.pending.remove(&id) {
            Some(pc) => {
                settle(&pc.slot, Err(failure));
                true
            }
            None => {
                debug!(id, "failure for unknown request id; ignoring");
                false
            }
        }
    }

    /// Drop the pending completion for `id` without settling its slot.
    /// Returns the cancellable flag if an entry existed.
    pub(crate) fn forget(&mut self, id: u64) -> Option<bool> {
        self.pending.remove(&id).map(|pc| pc.cancellable)
    }

    pub(crate) fn notify_cancel(&self, id: u64) {
        self.transport.cancel(id);
    }

    /// Reject every pending completion owned by one of the given scopes with
    /// a cancellation failure, notifying the transport for cancellable ones.
    pub(crate) fn cancel_scopes(&mut self, scope_ids: &[u64]) {
        let mut doomed: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pc)| scope_ids.contains(&pc.scope) && !is_settled(&pc.slot))
            .map(|(id, _)| *id)
            .collect();
        doomed.sort_unstable();
        for id in doomed {
            if let Some(pc) = self.pending.remove(&id) {
                settle(&pc.slot, Err(Failure::cancelled("scope cancelled")));
                if pc.cancellable {
                    self.transport.cancel(id);
                }
            }
        }
    }

    /// Forced teardown: one transport cancellation per outstanding id, then
    /// an empty pending table. Returns the ids that were cancelled.
    pub(crate) fn cancel_all(&mut self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            self.transport.cancel(*id);
        }
        self.pending.clear();
        ids
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<Request>>,
        cancelled: Mutex<Vec<u64>>,
    }

    impl Transport for FakeTransport {
        fn send(&self, request: &Request) {
            self.sent.lock().unwrap().push(request.clone());
        }

        fn cancel(&self, id: u64) {
            self.cancelled.lock().unwrap().push(id);
        }
    }

    fn client() -> (CorrelatedClient, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        (CorrelatedClient::new(transport.clone()), transport)
    }

    #[test]
    fn send_registers_exactly_one_pending_completion() {
        let (mut c, transport) = client();
        let (id, _slot) = c.send(RequestKind::Timer, vec![Payload::from(5)], true, 0);
        assert_eq!(c.pending_len(), 1);
        assert!(c.pending.contains_key(&id));
        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        assert!(c.resolve(id, Payload::Null));
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn resolve_unknown_id_is_a_no_op() {
        let (mut c, _transport) = client();
        assert!(!c.resolve(42, Payload::Null));
        assert!(!c.reject(42, Failure::cancelled("late")));
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn ids_are_monotonic_per_client() {
        let (mut c, _transport) = client();
        let (a, _) = c.send(RequestKind::Timer, vec![], true, 0);
        let (b, _) = c.send(RequestKind::Timer, vec![], true, 0);
        let (d, _) = c.send(RequestKind::Timer, vec![], true, 0);
        assert!(a < b && b < d);
    }

    #[test]
    fn wraparound_skips_ids_still_pending() {
        let (mut c, _transport) = client();
        c.next_id = REQUEST_ID_WRAP;
        let (edge, _) = c.send(RequestKind::Timer, vec![], true, 0);
        assert_eq!(edge, REQUEST_ID_WRAP);

        // Occupy the first post-wrap id so the generator has to skip it.
        c.pending.insert(
            1,
            PendingCompletion {
                slot: new_slot(),
                cancellable: false,
                scope: 0,
            },
        );
        let (next, _) = c.send(RequestKind::Timer, vec![], true, 0);
        assert_eq!(next, 2);
    }

    #[test]
    fn cancel_scopes_rejects_owned_requests_only() {
        let (mut c, transport) = client();
        let (in_scope, slot_a) = c.send(RequestKind::ExecuteActivity, vec![], true, 7);
        let (elsewhere, slot_b) = c.send(RequestKind::ExecuteActivity, vec![], true, 3);

        c.cancel_scopes(&[7]);
        assert!(!c.pending.contains_key(&in_scope));
        assert!(c.pending.contains_key(&elsewhere));
        assert!(is_settled(&slot_a));
        assert!(!is_settled(&slot_b));
        assert_eq!(*transport.cancelled.lock().unwrap(), vec![in_scope]);
    }

    #[test]
    fn cancel_all_notifies_once_per_outstanding_id() {
        let (mut c, transport) = client();
        let (a, _) = c.send(RequestKind::Timer, vec![], true, 0);
        let (b, _) = c.send(RequestKind::ExecuteActivity, vec![], true, 0);

        let ids = c.cancel_all();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(*transport.cancelled.lock().unwrap(), vec![a, b]);
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn fire_and_forget_leaves_no_pending_entry() {
        let (mut c, transport) = client();
        let id = c.send_fire_and_forget(RequestKind::CompleteWorkflow, vec![Payload::Null]);
        assert!(!c.pending.contains_key(&id));
        assert_eq!(
            transport.sent.lock().unwrap()[0].kind,
            RequestKind::CompleteWorkflow
        );
    }
}
