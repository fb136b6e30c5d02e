//! Bounded retry loop for optimistic transactions

use crate::config::RetryPolicy;
use crate::store::CommitOutcome;
use crate::{Result, TsdbError};
use std::future::Future;
use tracing::{debug, warn};

/// Outcome of one transaction attempt
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    Done(T),
    Conflict,
}

impl<T> Attempt<T> {
    /// Map a commit outcome to an attempt result carrying `value` on success
    pub(crate) fn from_commit(outcome: CommitOutcome, value: T) -> Self {
        match outcome {
            CommitOutcome::Committed => Attempt::Done(value),
            CommitOutcome::Conflict => Attempt::Conflict,
        }
    }
}

/// Run `attempt` until it commits, it fails with a non-retryable error, or
/// the policy's attempt bound is reached.
///
/// Each call to `attempt` must run a whole begin/read/write/commit sequence
/// in a fresh transaction. Exhausted conflicts surface as
/// [`TsdbError::TransactionConflict`]; exhausted transient failures surface
/// as the last error seen.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut tries = 1;

    loop {
        match attempt().await {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::Conflict) => {
                if tries >= max_attempts {
                    warn!("{}: giving up after {} conflicting attempts", operation, tries);
                    return Err(TsdbError::TransactionConflict { attempts: tries });
                }
                debug!("{}: commit conflict on attempt {}, retrying", operation, tries);
            }
            Err(e) if e.is_retryable() => {
                if tries >= max_attempts {
                    warn!("{}: giving up after {} attempts: {}", operation, tries, e);
                    return Err(e);
                }
                debug!("{}: attempt {} failed ({}), retrying", operation, tries, e);
            }
            Err(e) => return Err(e),
        }

        tokio::time::sleep(policy.delay_after(tries)).await;
        tries += 1;
    }
}
