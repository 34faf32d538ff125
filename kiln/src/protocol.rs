//! Wire contract with the in-guest runtime agent.
//!
//! The agent listens on the guest's port 8080: `GET /health` for
//! readiness, `POST /invoke` to run the handler. It compiles and caches
//! user code keyed on the code string, captures console output into
//! `logs`, and enforces its own deadline from `timeout_ms`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestHealth {
    pub status: String,
    pub runtime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub code: String,
    pub handler: String,
    pub event: Value,
    pub env: HashMap<String, String>,
    pub function_name: String,
    pub memory_mb: i32,
    pub timeout_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: i32,

    #[serde(default)]
    pub body: Value,

    #[serde(default)]
    pub logs: String,

    #[serde(default)]
    pub duration_ms: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_snake_case_with_camel_status() {
        let request = InvocationRequest {
            code: "x".to_string(),
            handler: "index.handler".to_string(),
            event: serde_json::json!({"x": 1}),
            env: HashMap::new(),
            function_name: "hello".to_string(),
            memory_mb: 128,
            timeout_ms: 30_000,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["function_name"], "hello");
        assert_eq!(json["timeout_ms"], 30_000);
    }

    #[test]
    fn success_response_parses() {
        let response: InvocationResponse = serde_json::from_str(
            r#"{"statusCode":200,"body":{"ok":true},"logs":"","duration_ms":12}"#,
        )
        .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body["ok"], true);
        assert!(response.error.is_none());
    }

    #[test]
    fn handler_error_response_parses() {
        let response: InvocationResponse = serde_json::from_str(
            r#"{"statusCode":500,"error":"boom","stack":"Error: boom\n  at handler","logs":"oops","duration_ms":3}"#,
        )
        .unwrap();
        assert_eq!(response.status_code, 500);
        assert_eq!(response.error.as_deref(), Some("boom"));
        assert!(response.stack.is_some());
    }
}
