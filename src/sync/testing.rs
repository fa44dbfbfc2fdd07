use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::error::Result;
use crate::sync::transport::{AuthProvider, Method, RemoteRequest, RemoteResponse, Transport};

type Handler = Box<dyn Fn(&RemoteRequest) -> Option<Result<RemoteResponse>> + Send + Sync>;

/// In-process server stand-in. Records every request. Creates get ids
/// `S1`, `S2`, ... unless the handler answers first.
pub(crate) struct FakeTransport {
    calls: Mutex<Vec<RemoteRequest>>,
    next_id: AtomicU64,
    handler: Handler,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_handler(|_| None)
    }

    pub fn with_handler(
        handler: impl Fn(&RemoteRequest) -> Option<Result<RemoteResponse>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            handler: Box::new(handler),
        }
    }

    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn bodies_for(&self, path: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .filter_map(|c| c.body)
            .collect()
    }
}

impl Transport for FakeTransport {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(answer) = (self.handler)(&request) {
            return answer;
        }
        Ok(match request.method {
            Method::Post => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                RemoteResponse::new(201, json!({"data": {"id": format!("S{n}")}}))
            }
            Method::Patch => RemoteResponse::new(200, json!({"ok": true})),
            Method::Delete => RemoteResponse::new(204, Value::Null),
        })
    }
}

/// Counts 401 callbacks.
#[derive(Default)]
pub(crate) struct CountingAuth {
    pub unauthorized: AtomicUsize,
}

impl AuthProvider for CountingAuth {
    fn bearer_token(&self) -> Option<String> {
        Some("test-token".into())
    }

    fn on_unauthorized(&self) {
        self.unauthorized.fetch_add(1, Ordering::SeqCst);
    }
}
