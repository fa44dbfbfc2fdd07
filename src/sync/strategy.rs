use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Operation, OperationType};
use crate::sync::transport::{Method, RemoteRequest, RemoteResponse, Transport};

/// What the server confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Create accepted. The server id, when the response carried one.
    Created { server_id: Option<String> },
    /// Update or delete accepted.
    Applied,
}

pub type RemoteResult = Result<RemoteOutcome>;

/// Maps an operation to its REST call. Stateless; one per operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Create,
    Update,
    Delete,
}

impl Strategy {
    pub fn for_operation(op: &Operation) -> Self {
        match op.op_type {
            OperationType::Create => Strategy::Create,
            OperationType::Update => Strategy::Update,
            OperationType::Delete => Strategy::Delete,
        }
    }

    pub fn request(&self, op: &Operation) -> RemoteRequest {
        let collection = op.entity.collection();
        match self {
            Strategy::Create => RemoteRequest {
                method: Method::Post,
                path: collection.to_string(),
                body: Some(op.payload.clone()),
            },
            Strategy::Update => RemoteRequest {
                method: Method::Patch,
                path: format!("{collection}/{}", op.entity_id),
                body: Some(op.payload.clone()),
            },
            Strategy::Delete => RemoteRequest {
                method: Method::Delete,
                path: format!("{collection}/{}", op.entity_id),
                body: None,
            },
        }
    }

    pub async fn execute<T: Transport>(self, transport: &T, op: &Operation) -> RemoteResult {
        let response = transport.send(self.request(op)).await?;
        self.classify(response)
    }

    /// Turn an HTTP response into an outcome or a typed error.
    pub fn classify(&self, response: RemoteResponse) -> RemoteResult {
        let status = response.status;
        match status {
            200..=299 => Ok(match self {
                Strategy::Create => RemoteOutcome::Created {
                    server_id: server_id(&response.body),
                },
                Strategy::Update | Strategy::Delete => RemoteOutcome::Applied,
            }),
            401 | 403 => Err(Error::Auth { status }),
            404 | 410 if *self != Strategy::Create => Err(Error::Conflict(format!(
                "{status}: {}",
                error_message(&response.body)
            ))),
            408 | 429 | 500..=599 => Err(Error::Network(format!(
                "{status}: {}",
                error_message(&response.body)
            ))),
            _ => Err(Error::Rejected {
                status,
                message: error_message(&response.body),
            }),
        }
    }
}

/// Server id from `data.id` or `id`, string or number.
pub fn server_id(body: &Value) -> Option<String> {
    let id = body
        .get("data")
        .and_then(|d| d.get("id"))
        .or_else(|| body.get("id"))?;
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn error_message(body: &Value) -> String {
    match body {
        Value::Null => "no response body".to_string(),
        Value::String(s) => s.chars().take(200).collect(),
        other => ["message", "error"]
            .iter()
            .find_map(|key| other.get(key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
