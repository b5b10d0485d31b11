use serde::{Deserialize, Serialize};

/// StreamableHTTP request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Command to execute (e.g., "kv.set", "pubsub.publish")
    pub command: String,
    pub request_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// StreamableHTTP response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    /// Echo of the request's identifier
    pub request_id: String,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Request {
    pub fn new(command: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }
}

impl Response {
    pub fn success(request_id: String, payload: serde_json::Value) -> Self {
        Self {
            success: true,
            request_id,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(request_id: String, error: impl Into<String>) -> Self {
        Self {
            success: false,
            request_id,
            payload: None,
            error: Some(error.into()),
        }
    }
}
