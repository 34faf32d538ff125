//! End-to-end invocation: acquire a VM, dispatch to the guest agent,
//! classify the outcome, return the VM or destroy it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Error;
use crate::model::functions::Function;
use crate::pool::WarmPool;
use crate::protocol::{InvocationRequest, InvocationResponse};
use crate::registry::FunctionRegistry;
use crate::vmm::{Vm, VmManager, VmmError};

/// Invocation outcomes as a tagged variant; HTTP mapping happens at the
/// handler edge only.
#[derive(Debug)]
pub enum Outcome {
    Completed {
        body: Value,
        logs: String,
        duration_ms: i64,
    },
    HandlerFailed {
        error: String,
        stack: Option<String>,
        logs: Option<String>,
    },
    Timeout,
    Unavailable(String),
}

pub struct Invoker {
    registry: Arc<FunctionRegistry>,
    pool: Arc<WarmPool>,
    manager: Arc<VmManager>,
}

/// Returns the VM as non-reusable if the invocation future is dropped
/// mid-flight (client disconnect cancels the guest request; the VM must
/// not be handed out again).
struct ReleaseGuard {
    pool: Arc<WarmPool>,
    vm: Option<Arc<Vm>>,
}

impl ReleaseGuard {
    fn new(pool: Arc<WarmPool>, vm: Arc<Vm>) -> Self {
        Self {
            pool,
            vm: Some(vm),
        }
    }

    fn disarm(mut self) {
        self.vm.take();
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(vm) = self.vm.take() {
            let pool = self.pool.clone();
            warn!("invocation cancelled, discarding VM {}", vm.id);
            tokio::spawn(async move { pool.release(vm, false).await });
        }
    }
}

impl Invoker {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        pool: Arc<WarmPool>,
        manager: Arc<VmManager>,
    ) -> Self {
        Self {
            registry,
            pool,
            manager,
        }
    }

    pub async fn invoke(&self, function: &Function, event: Value) -> Result<Outcome, Error> {
        let code = self.registry.get_code(&function.name).await?;
        let request = InvocationRequest {
            code,
            handler: function.handler.clone(),
            event,
            env: function.environment.clone(),
            function_name: function.name.clone(),
            memory_mb: function.memory_mb,
            timeout_ms: i64::from(function.timeout_sec) * 1000,
        };
        let deadline = Duration::from_secs(function.timeout_sec.max(1) as u64);

        // A VM that is unreachable may just be a bad pool entry; one
        // fresh acquire is allowed, with no backoff.
        let mut attempts = 0;
        loop {
            attempts += 1;

            let vm = match self.pool.acquire(function.runtime).await {
                Ok(vm) => vm,
                Err(e) if attempts == 1 => {
                    warn!("acquire for '{}' failed, retrying once: {}", function.name, e);
                    continue;
                }
                Err(e) => return Ok(Outcome::Unavailable(e.to_string())),
            };

            let guard = ReleaseGuard::new(self.pool.clone(), vm.clone());
            let result = self.manager.execute(&vm, &request, deadline).await;
            guard.disarm();

            match result {
                Ok(response) => {
                    // A handler-level failure does not corrupt the VM.
                    self.pool.release(vm, true).await;
                    return Ok(classify(response));
                }
                Err(VmmError::Guest(e)) if e.is_timeout() => {
                    debug!("invocation of '{}' hit its deadline", function.name);
                    self.pool.release(vm, false).await;
                    return Ok(Outcome::Timeout);
                }
                Err(e) => {
                    self.pool.release(vm, false).await;
                    if attempts == 1 {
                        warn!(
                            "guest for '{}' unreachable, retrying on a fresh VM: {}",
                            function.name, e
                        );
                        continue;
                    }
                    return Ok(Outcome::Unavailable(e.to_string()));
                }
            }
        }
    }
}

fn classify(response: InvocationResponse) -> Outcome {
    if response.status_code == 200 {
        Outcome::Completed {
            body: response.body,
            logs: response.logs,
            duration_ms: response.duration_ms,
        }
    } else {
        let logs = if response.logs.is_empty() {
            None
        } else {
            Some(response.logs)
        };
        Outcome::HandlerFailed {
            error: response
                .error
                .unwrap_or_else(|| format!("handler returned status {}", response.status_code)),
            stack: response.stack,
            logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_response_is_completed() {
        let outcome = classify(InvocationResponse {
            status_code: 200,
            body: serde_json::json!({"ok": true}),
            logs: "hi".to_string(),
            duration_ms: 7,
            error: None,
            stack: None,
        });
        match outcome {
            Outcome::Completed {
                body,
                logs,
                duration_ms,
            } => {
                assert_eq!(body["ok"], true);
                assert_eq!(logs, "hi");
                assert_eq!(duration_ms, 7);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn error_response_is_handler_failed() {
        let outcome = classify(InvocationResponse {
            status_code: 500,
            body: Value::Null,
            logs: String::new(),
            duration_ms: 3,
            error: Some("boom".to_string()),
            stack: Some("Error: boom".to_string()),
        });
        match outcome {
            Outcome::HandlerFailed { error, stack, logs } => {
                assert_eq!(error, "boom");
                assert_eq!(stack.as_deref(), Some("Error: boom"));
                assert!(logs.is_none());
            }
            other => panic!("expected HandlerFailed, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_status_becomes_handler_failed() {
        let outcome = classify(InvocationResponse {
            status_code: 503,
            body: Value::Null,
            logs: String::new(),
            duration_ms: 0,
            error: None,
            stack: None,
        });
        match outcome {
            Outcome::HandlerFailed { error, .. } => {
                assert!(error.contains("503"));
            }
            other => panic!("expected HandlerFailed, got {other:?}"),
        }
    }
}
