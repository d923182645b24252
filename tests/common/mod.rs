#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use filament::client::Transport;
use filament::{Payload, Request, RequestKind, Response};

/// Transport that records everything crossing the host boundary.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Request>>,
    cancelled: Mutex<Vec<u64>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Request> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_kinds(&self) -> Vec<RequestKind> {
        self.sent.lock().unwrap().iter().map(|r| r.kind).collect()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Id of the most recently sent request of the given kind.
    pub fn last_id_of(&self, kind: RequestKind) -> u64 {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.kind == kind)
            .map(|r| r.id)
            .expect("no request of requested kind was sent")
    }

    /// Ids of every sent request of the given kind, in send order.
    pub fn ids_of(&self, kind: RequestKind) -> Vec<u64> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.id)
            .collect()
    }

    pub fn last_request(&self) -> Request {
        self.sent.lock().unwrap().last().cloned().expect("nothing sent")
    }
}

impl Transport for RecordingTransport {
    fn send(&self, request: &Request) {
        self.sent.lock().unwrap().push(request.clone());
    }

    fn cancel(&self, id: u64) {
        self.cancelled.lock().unwrap().push(id);
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

pub fn ok(id: u64, value: Payload) -> Response {
    Response::ok(id, value)
}
