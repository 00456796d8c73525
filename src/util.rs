use std::future::Future;

use anyhow::Context;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Run `f` to completion unless the token fires first.
pub async fn run_until_cancelled<F: Future>(
    f: F,
    cancellation_token: &CancellationToken,
) -> Option<F::Output> {
    tokio::select! {
        res = f => Some(res),
        () = cancellation_token.cancelled() => None,
    }
}

/// Flatten the result of an awaited task into the task's own result.
pub fn flatten_err<T>(r: Result<anyhow::Result<T>, JoinError>) -> anyhow::Result<T> {
    r.context("join error").and_then(|x| x)
}
