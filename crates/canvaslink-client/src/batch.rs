//! Sequential batch execution over a fallible per-item operation.
//!
//! Items run strictly one at a time. With `skip_errors` set (the default) a
//! failed item is recorded and the batch moves on; otherwise the first
//! failure aborts the batch and surfaces as the overall error.

use std::future::Future;

use crate::error::LinkError;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Record per-item failures and continue instead of aborting.
    pub skip_errors: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { skip_errors: true }
    }
}

/// Per-item outcome, in input order.
#[derive(Debug)]
pub enum BatchOutcome<R> {
    Success(R),
    Failure(LinkError),
}

impl<R> BatchOutcome<R> {
    pub fn succeeded(&self) -> bool {
        matches!(self, BatchOutcome::Success(_))
    }

    pub fn value(&self) -> Option<&R> {
        match self {
            BatchOutcome::Success(value) => Some(value),
            BatchOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&LinkError> {
        match self {
            BatchOutcome::Success(_) => None,
            BatchOutcome::Failure(err) => Some(err),
        }
    }
}

/// Result of a completed (non-aborted) batch.
#[derive(Debug)]
pub struct BatchReport<R> {
    /// One outcome per input item, same order.
    pub outcomes: Vec<BatchOutcome<R>>,
    pub succeeded: usize,
    pub failed: usize,
}

impl<R> BatchReport<R> {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_partial_failure(&self) -> bool {
        self.failed > 0 && self.succeeded > 0
    }

    pub fn summary(&self) -> String {
        format!("{} succeeded, {} failed", self.succeeded, self.failed)
    }
}

/// Run `operation` over `items` sequentially. In skip-errors mode the report
/// always covers every item; in fail-fast mode the first error is returned
/// and the remaining items never run.
pub async fn run_batch<T, R, F, Fut>(
    items: Vec<T>,
    options: BatchOptions,
    mut operation: F,
) -> Result<BatchReport<R>, LinkError>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R, LinkError>>,
{
    let mut outcomes = Vec::with_capacity(items.len());
    let mut succeeded = 0;
    let mut failed = 0;

    for (index, item) in items.into_iter().enumerate() {
        match operation(item).await {
            Ok(value) => {
                succeeded += 1;
                outcomes.push(BatchOutcome::Success(value));
            }
            Err(err) if options.skip_errors => {
                tracing::warn!(index, error = %err, "batch item failed, continuing");
                failed += 1;
                outcomes.push(BatchOutcome::Failure(err));
            }
            Err(err) => {
                tracing::warn!(index, error = %err, "batch aborted");
                return Err(err);
            }
        }
    }

    Ok(BatchReport {
        outcomes,
        succeeded,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn flaky(item: u32) -> Result<u32, LinkError> {
        if item % 2 == 1 {
            Err(LinkError::Remote(format!("item {item} exploded")))
        } else {
            Ok(item * 10)
        }
    }

    #[tokio::test]
    async fn skip_errors_records_failures_and_continues() {
        let report = run_batch(vec![0, 1, 2, 3, 4], BatchOptions::default(), flaky)
            .await
            .unwrap();

        assert_eq!(report.total(), 5);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 2);
        assert!(report.is_partial_failure());
        assert_eq!(report.summary(), "3 succeeded, 2 failed");

        assert_eq!(report.outcomes[0].value(), Some(&0));
        assert!(!report.outcomes[1].succeeded());
        assert!(matches!(
            report.outcomes[1].error(),
            Some(LinkError::Remote(_))
        ));
        assert_eq!(report.outcomes[4].value(), Some(&40));
    }

    #[tokio::test]
    async fn fail_fast_stops_at_the_first_error() {
        let mut attempted = Vec::new();
        let err = run_batch(
            vec![0, 1, 2, 3],
            BatchOptions { skip_errors: false },
            |item| {
                attempted.push(item);
                flaky(item)
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LinkError::Remote(ref msg) if msg == "item 1 exploded"));
        assert_eq!(attempted, vec![0, 1]);
    }

    #[tokio::test]
    async fn empty_batch_yields_an_empty_report() {
        let report = run_batch(Vec::<u32>::new(), BatchOptions::default(), flaky)
            .await
            .unwrap();
        assert_eq!(report.total(), 0);
        assert!(!report.is_partial_failure());
    }
}
