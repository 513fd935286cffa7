//! Command correlation layer.
//!
//! Each dispatched command gets a fresh correlation id and a pending-table
//! entry holding a single-use completion. An entry leaves the table exactly
//! once: via the matching inbound envelope, via its deadline, or via
//! `fail_all` on connection loss. Removal happens under one lock, which is
//! what makes resolution exactly-once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use canvaslink_protocol::{Envelope, ProgressEvent};

use crate::connection::ConnectionState;
use crate::error::LinkError;

/// Traffic queued to the connection manager for the wire.
pub(crate) enum Outbound {
    Envelope(Envelope),
    Progress(ProgressEvent),
}

struct PendingRequest {
    command: String,
    deadline: Instant,
    complete: oneshot::Sender<Result<Value, LinkError>>,
}

/// Table of in-flight requests, shared between the dispatcher and the
/// connection manager.
#[derive(Clone, Default)]
pub(crate) struct PendingTable {
    inner: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl PendingTable {
    fn insert(&self, id: String, pending: PendingRequest) {
        self.inner.lock().unwrap().insert(id, pending);
    }

    fn take(&self, id: &str) -> Option<PendingRequest> {
        self.inner.lock().unwrap().remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    /// Resolve or reject the matching pending request. Returns false when no
    /// entry matches (late response, echo, or never ours).
    pub(crate) fn resolve_envelope(&self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Response { id, result } => match self.take(&id) {
                Some(pending) => {
                    let _ = pending.complete.send(Ok(result));
                    true
                }
                None => {
                    tracing::trace!(id = %id, "response for unknown or expired request");
                    false
                }
            },
            Envelope::Failure { id, error } => match self.take(&id) {
                Some(pending) => {
                    let _ = pending.complete.send(Err(LinkError::from_remote(error)));
                    true
                }
                None => {
                    tracing::trace!(id = %id, "failure for unknown or expired request");
                    false
                }
            },
            Envelope::Echo { id } => {
                // Neither result nor error: nothing to correlate.
                tracing::trace!(id = %id, "ignoring echo envelope");
                false
            }
            Envelope::Request { .. } => false,
        }
    }

    /// Reject every pending request. Used on socket loss so no waiter leaks.
    pub(crate) fn fail_all(&self, error: impl Fn() -> LinkError) {
        let drained: Vec<(String, PendingRequest)> =
            self.inner.lock().unwrap().drain().collect();
        for (id, pending) in drained {
            tracing::debug!(id = %id, command = %pending.command, "rejecting pending request");
            let _ = pending.complete.send(Err(error()));
        }
    }

    /// Reject entries whose deadline has passed. Covers waiters that were
    /// dropped without consuming their completion.
    pub(crate) fn reject_expired(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingRequest)> = {
            let mut inner = self.inner.lock().unwrap();
            let ids: Vec<String> = inner
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.remove(&id).map(|pending| (id, pending)))
                .collect()
        };
        let count = expired.len();
        for (id, pending) in expired {
            tracing::debug!(id = %id, command = %pending.command, "request expired");
            let command = pending.command;
            let _ = pending.complete.send(Err(LinkError::Timeout { command }));
        }
        count
    }
}

/// Sends commands through the channel and awaits their correlated responses.
#[derive(Clone)]
pub struct CommandDispatcher {
    table: PendingTable,
    outbound: mpsc::Sender<Outbound>,
    state: Option<watch::Receiver<ConnectionState>>,
    default_timeout: Duration,
}

impl CommandDispatcher {
    pub(crate) fn new(
        outbound: mpsc::Sender<Outbound>,
        table: PendingTable,
        state: Option<watch::Receiver<ConnectionState>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            table,
            outbound,
            state,
            default_timeout,
        }
    }

    /// Dispatch a command with the default per-request timeout.
    pub async fn dispatch(&self, command: &str, params: Value) -> Result<Value, LinkError> {
        self.dispatch_with_timeout(command, params, self.default_timeout)
            .await
    }

    /// Dispatch a command and await its response, rejecting with `Timeout`
    /// when no matching envelope arrives before the deadline.
    pub async fn dispatch_with_timeout(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, LinkError> {
        if let Some(state) = &self.state {
            let connected = *state.borrow() == ConnectionState::Connected;
            if !connected {
                return Err(LinkError::ConnectionLost);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (complete, mut receiver) = oneshot::channel();
        self.table.insert(
            id.clone(),
            PendingRequest {
                command: command.to_string(),
                deadline: Instant::now() + timeout,
                complete,
            },
        );
        tracing::debug!(command, id = %id, "dispatching command");

        let request = Envelope::Request {
            id: id.clone(),
            command: command.to_string(),
            params,
        };
        if self.outbound.send(Outbound::Envelope(request)).await.is_err() {
            self.table.take(&id);
            return Err(LinkError::ConnectionLost);
        }

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Completion sender dropped without resolving: the table was
            // torn down underneath us.
            Ok(Err(_)) => Err(LinkError::ConnectionLost),
            Err(_) => {
                // The deadline and a response can race; whoever removes the
                // entry wins.
                if self.table.take(&id).is_some() {
                    tracing::debug!(command, id = %id, "request timed out");
                    Err(LinkError::Timeout {
                        command: command.to_string(),
                    })
                } else {
                    match receiver.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(LinkError::ConnectionLost),
                    }
                }
            }
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }
}
