//! Command execution on the plugin side of the channel: a registry of named
//! async handlers, driven by the inbound request stream.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use canvaslink_protocol::Envelope;

use crate::connection::Responder;

/// Failure reported by a command handler. The display strings are the wire
/// contract: the dispatcher on the other side maps the `not found:` prefix
/// back to a typed error.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("invalid params: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ExecError>> + Send>>;

/// An async command handler. Implemented for any `Fn(Value) -> Future`.
pub trait CommandHandler: Send + Sync {
    fn call(&self, params: Value) -> HandlerFuture;
}

impl<F, Fut> CommandHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecError>> + Send + 'static,
{
    fn call(&self, params: Value) -> HandlerFuture {
        Box::pin(self(params))
    }
}

/// Registry of command handlers keyed by command name.
#[derive(Default)]
pub struct CommandExecutor {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.handlers.insert(command.into(), Arc::new(handler));
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute a request envelope and build the reply. Non-request envelopes
    /// yield no reply. Handlers run on their own task, so a panicking handler
    /// produces a failure reply instead of taking the executor down.
    pub async fn execute(&self, envelope: Envelope) -> Option<Envelope> {
        let Envelope::Request { id, command, params } = envelope else {
            return None;
        };

        let Some(handler) = self.handlers.get(&command) else {
            tracing::warn!(command = %command, "unknown command");
            return Some(Envelope::Failure {
                id,
                error: format!("unknown command: {command}"),
            });
        };

        tracing::debug!(command = %command, id = %id, "executing command");
        let reply = match tokio::spawn(handler.call(params)).await {
            Ok(Ok(result)) => Envelope::Response { id, result },
            Ok(Err(err)) => Envelope::Failure {
                id,
                error: err.to_string(),
            },
            Err(join_err) => {
                tracing::error!(command = %command, error = %join_err, "handler crashed");
                Envelope::Failure {
                    id,
                    error: format!("handler crashed: {command}"),
                }
            }
        };
        Some(reply)
    }

    /// Drain the inbound request stream, executing each request and sending
    /// the reply back through the channel. Returns when either side closes.
    pub async fn run(self, mut requests: mpsc::Receiver<Envelope>, responder: Responder) {
        while let Some(request) = requests.recv().await {
            if let Some(reply) = self.execute(request).await {
                if responder.send(reply).await.is_err() {
                    tracing::debug!("link closed, executor stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executor() -> CommandExecutor {
        let mut executor = CommandExecutor::new();
        executor.register("create_rectangle", |params: Value| async move {
            if params.get("width").is_none() {
                return Err(ExecError::Validation("width is required".to_string()));
            }
            Ok(json!({"id": "123:456"}))
        });
        executor.register("delete_node", |_params: Value| async move {
            Err::<Value, _>(ExecError::NotFound("node 9:12".to_string()))
        });
        executor
    }

    fn request(command: &str, params: Value) -> Envelope {
        Envelope::Request {
            id: "corr-1".to_string(),
            command: command.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn known_command_yields_a_response() {
        let reply = executor()
            .execute(request("create_rectangle", json!({"width": 100})))
            .await
            .unwrap();
        match reply {
            Envelope::Response { id, result } => {
                assert_eq!(id, "corr-1");
                assert_eq!(result["id"], "123:456");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_errors_become_failure_replies() {
        let reply = executor()
            .execute(request("create_rectangle", json!({})))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Envelope::Failure { ref error, .. } if error == "invalid params: width is required"
        ));

        let reply = executor()
            .execute(request("delete_node", json!({})))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Envelope::Failure { ref error, .. } if error == "not found: node 9:12"
        ));
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let reply = executor()
            .execute(request("set_fill_color", json!({})))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Envelope::Failure { ref error, .. } if error == "unknown command: set_fill_color"
        ));
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let mut executor = CommandExecutor::new();
        executor.register("explode", |_params: Value| async move {
            panic!("handler bug");
            #[allow(unreachable_code)]
            Ok(Value::Null)
        });

        let reply = executor
            .execute(request("explode", json!({})))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Envelope::Failure { ref error, .. } if error == "handler crashed: explode"
        ));
    }

    #[tokio::test]
    async fn non_request_envelopes_yield_no_reply() {
        let executor = executor();
        assert!(
            executor
                .execute(Envelope::Response {
                    id: "r1".to_string(),
                    result: json!({}),
                })
                .await
                .is_none()
        );
        assert!(
            executor
                .execute(Envelope::Echo {
                    id: "e1".to_string()
                })
                .await
                .is_none()
        );
    }
}
