// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Retry envelope (spec §4.2): wraps any fallible async operation with
//! bounded exponential-backoff retries and domain-specific error
//! classification. Retries never alter semantics -- they retry only the
//! outermost attempt per call, the same shape as the backoff loop in
//! `commit_syncer.rs`'s fetch scheduling, generalized into a reusable
//! helper.

use std::fmt::Debug;
use std::future::Future;

use tracing::{debug, warn};

use crate::context::FailoverOptions;
use crate::error::CacheError;

/// Attempts `op` up to `max_retries + 1` times total, sleeping
/// `retry_delay * 2^(attempt-1)` between attempts when exponential
/// backoff is enabled (spec §4.2). Surfaces the last error after
/// exhaustion.
pub async fn execute_with_retry<T, E, F, Fut>(options: &FailoverOptions, context: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Debug,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt > options.max_retries {
                    warn!(context, attempt, ?err, "retries exhausted");
                    return Err(err);
                }
                let delay = if options.exponential_backoff {
                    options.retry_delay * 2u32.pow(attempt - 1)
                } else {
                    options.retry_delay
                };
                debug!(context, attempt, ?delay, ?err, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Specialization for subscription-transport operations (spec §4.2):
/// logs connection-reset/refused distinctly and re-raises everything.
pub async fn handle_ws_operation<T, F, Fut>(
    options: &FailoverOptions,
    subject: &str,
    mut op: F,
) -> Result<T, CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    execute_with_retry(options, subject, || async {
        match op().await {
            Err(CacheError::Transport(msg)) if msg.contains("ECONNREFUSED") => {
                warn!(subject, "connection refused");
                Err(CacheError::Transport(msg))
            }
            Err(CacheError::Transport(msg)) if msg.contains("ECONNRESET") => {
                warn!(subject, "connection reset");
                Err(CacheError::Transport(msg))
            }
            other => other,
        }
    })
    .await
}

/// Specialization for durable-store operations (spec §4.2): converts a
/// `NotFound` into `Ok(None)`, re-raises everything else after retry
/// exhaustion.
pub async fn handle_db_operation<T, F, Fut>(options: &FailoverOptions, context: &str, op: F) -> Result<Option<T>, CacheError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    match execute_with_retry(options, context, || async { op().await }).await {
        Ok(value) => Ok(Some(value)),
        Err(CacheError::NotFound) => Ok(None),
        Err(other) => Err(other),
    }
}
