//! Chunked progress reporting for long-running bulk commands.
//!
//! A reporter owns one command id and emits its lifecycle: one `started`,
//! an `in_progress` per processed chunk, and exactly one terminal event
//! (`completed` or `error`). Percentages reserve a small baseline for the
//! discovery phase and spread the rest across chunks, so a bulk command
//! shows movement before the first chunk lands.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use canvaslink_protocol::{ChunkInfo, ProgressEvent, ProgressStatus};

use crate::error::LinkError;

/// Share of the percentage range reported before chunk processing starts.
const DISCOVERY_BASELINE: f64 = 5.0;
/// Share of the percentage range spread across the chunks.
const CHUNK_SPAN: f64 = 95.0;
/// Pause between chunks, keeping the executor responsive to other traffic.
const CHUNK_YIELD: std::time::Duration = std::time::Duration::from_millis(5);

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Emits the progress lifecycle for one bulk command.
pub struct ProgressReporter {
    command_id: String,
    command_type: String,
    sink: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressReporter {
    pub fn new(
        command_type: impl Into<String>,
        sink: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            command_type: command_type.into(),
            sink,
        }
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    fn emit(
        &self,
        status: ProgressStatus,
        progress: u8,
        total_items: usize,
        processed_items: usize,
        message: String,
        chunk: Option<ChunkInfo>,
    ) {
        let event = ProgressEvent {
            command_id: self.command_id.clone(),
            command_type: self.command_type.clone(),
            status,
            progress,
            total_items,
            processed_items,
            message,
            chunk,
            timestamp: unix_millis(),
        };
        // A dropped receiver means nobody is listening anymore; the scan
        // itself still runs to completion.
        let _ = self.sink.send(event);
    }

    /// Process `items` in chunks of `chunk_size`, emitting progress around
    /// each chunk. On a chunk failure the terminal `error` event carries the
    /// last reported percentage and the scan stops.
    pub async fn scan_in_chunks<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        chunk_size: usize,
        mut process: F,
    ) -> Result<Vec<R>, LinkError>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<R>, LinkError>>,
    {
        let chunk_size = chunk_size.max(1);
        let total_items = items.len();
        let total_chunks = total_items.div_ceil(chunk_size);

        self.emit(
            ProgressStatus::Started,
            0,
            total_items,
            0,
            format!(
                "starting {} on {total_items} items in {total_chunks} chunks",
                self.command_type
            ),
            None,
        );
        tracing::debug!(
            command_id = %self.command_id,
            command_type = %self.command_type,
            total_items,
            total_chunks,
            "bulk scan started"
        );

        let mut results = Vec::with_capacity(total_items);
        let mut processed = 0;
        let mut last_progress = 0u8;
        let mut iter = items.into_iter();

        for current_chunk in 1..=total_chunks {
            let chunk: Vec<T> = iter.by_ref().take(chunk_size).collect();
            let chunk_len = chunk.len();
            match process(chunk).await {
                Ok(mut chunk_results) => {
                    results.append(&mut chunk_results);
                    processed += chunk_len;
                    last_progress = (DISCOVERY_BASELINE
                        + current_chunk as f64 / total_chunks as f64 * CHUNK_SPAN)
                        .round() as u8;
                    self.emit(
                        ProgressStatus::InProgress,
                        last_progress,
                        total_items,
                        processed,
                        format!("processed chunk {current_chunk}/{total_chunks}"),
                        Some(ChunkInfo {
                            current_chunk,
                            total_chunks,
                            chunk_size,
                        }),
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        command_id = %self.command_id,
                        chunk = current_chunk,
                        error = %err,
                        "bulk scan failed"
                    );
                    self.emit(
                        ProgressStatus::Error,
                        last_progress,
                        total_items,
                        processed,
                        err.to_string(),
                        Some(ChunkInfo {
                            current_chunk,
                            total_chunks,
                            chunk_size,
                        }),
                    );
                    return Err(err);
                }
            }
            if current_chunk < total_chunks {
                tokio::time::sleep(CHUNK_YIELD).await;
            }
        }

        self.emit(
            ProgressStatus::Completed,
            100,
            total_items,
            processed,
            format!("{} finished: {processed} items", self.command_type),
            None,
        );
        Ok(results)
    }
}
