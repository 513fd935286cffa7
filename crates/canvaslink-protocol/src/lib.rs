//! Wire protocol for the canvaslink automation channel.
//!
//! All traffic is JSON over WebSocket text frames. A plugin-side client and
//! an automation client rendezvous on a named channel at the relay; command
//! requests and their responses are paired by a correlation id carried in
//! the inner envelope.
//!
//! ```json
//! // join a channel
//! {"type": "join", "channel": "qx3k9f2m"}
//!
//! // request relayed through the channel
//! {"type": "message", "id": "...", "channel": "qx3k9f2m",
//!  "message": {"id": "corr-1", "command": "create_rectangle", "params": {}}}
//!
//! // response, matched by the inner id
//! {"type": "message", "id": "...", "channel": "qx3k9f2m",
//!  "message": {"id": "corr-1", "result": {"id": "123:456"}}}
//! ```

use serde::{Deserialize, Serialize};

/// Opaque token naming a relay channel.
pub type ChannelId = String;

/// Token linking a request envelope to its eventual response.
pub type CorrelationId = String;

/// Default relay port.
pub const DEFAULT_PORT: u16 = 3055;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default chunk size for progress-reported bulk operations.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Top-level frame exchanged with the relay.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Join a channel. The relay registers the sender as a member and
    /// confirms with a `system` frame.
    Join { channel: ChannelId },
    /// Relay notice (join confirmation, peer departure).
    System { channel: ChannelId, message: String },
    /// Command traffic relayed to the other channel member(s). The outer
    /// `id` identifies the frame; correlation happens on the inner envelope.
    Message {
        id: String,
        channel: ChannelId,
        message: Envelope,
    },
    /// Progress update for a long-running bulk command.
    CommandProgress(ProgressEvent),
    /// Relay-reported error, informational only.
    Error { message: String },
}

/// Inner command envelope. Requests carry a command name; responses carry
/// either a `result` or an `error` for the same correlation id. An envelope
/// with neither is an echo and is ignored by the correlation layer.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Envelope {
    Request {
        id: CorrelationId,
        command: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    Response {
        id: CorrelationId,
        result: serde_json::Value,
    },
    Failure {
        id: CorrelationId,
        error: String,
    },
    Echo {
        id: CorrelationId,
    },
}

impl Envelope {
    /// Correlation id of this envelope.
    pub fn id(&self) -> &str {
        match self {
            Envelope::Request { id, .. }
            | Envelope::Response { id, .. }
            | Envelope::Failure { id, .. }
            | Envelope::Echo { id } => id,
        }
    }
}

/// Lifecycle status of a progress stream. Exactly one `Completed` or
/// `Error` terminates the stream for a given command id.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
    Error,
}

/// Structured status event for a chunked bulk operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub command_id: String,
    pub command_type: String,
    pub status: ProgressStatus,
    /// 0..=100, non-decreasing within one command id's lifecycle.
    pub progress: u8,
    pub total_items: usize,
    pub processed_items: usize,
    pub message: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Chunk position within a bulk operation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub chunk_size: usize,
}
