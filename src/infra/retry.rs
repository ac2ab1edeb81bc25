//! Scoped transaction execution with bounded retry.
//!
//! `read_write_transaction` provides the commit-on-success,
//! rollback-on-failure contract, retrying conflict-shaped failures with
//! exponential backoff and jitter so concurrent sequencers back off each
//! other instead of thundering.

use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::domain::TreeMeta;

use super::{LogStorage, LogTx, Result};

/// Boxed future borrowing the transaction it runs against.
pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the backoff growth.
    pub max_delay: Duration,
    /// Backoff multiplier per attempt.
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0) applied around the computed delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Fast retries for in-memory backends and tests.
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }

    /// No retries; the first failure is final.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay for a given 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let delayed = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(delayed)
    }
}

/// Run `f` inside a read-write transaction on `tree`.
///
/// Commits iff `f` returns success; otherwise the transaction is closed and
/// its staged writes discarded. Conflict and transient database failures
/// are retried with a fresh transaction up to `config.max_retries` times;
/// every other error propagates immediately.
pub async fn read_write_transaction<F>(
    storage: &dyn LogStorage,
    tree: &TreeMeta,
    config: &RetryConfig,
    f: F,
) -> Result<()>
where
    F: for<'a> Fn(&'a mut dyn LogTx) -> TxFuture<'a, ()>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = run_once(storage, tree, &f).await;
        match outcome {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                tracing::warn!(
                    tree_id = %tree.id,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "read-write transaction conflicted, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_once<F>(storage: &dyn LogStorage, tree: &TreeMeta, f: &F) -> Result<()>
where
    F: for<'a> Fn(&'a mut dyn LogTx) -> TxFuture<'a, ()>,
{
    let mut tx = storage.begin_for_tree(tree).await?;
    match f(&mut *tx).await {
        Ok(()) => tx.commit().await,
        Err(e) => {
            if let Err(close_err) = tx.close().await {
                tracing::error!(
                    tree_id = %tree.id,
                    error = %close_err,
                    "failed to close transaction after error"
                );
            }
            Err(e)
        }
    }
}
