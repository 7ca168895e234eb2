use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::RosterApi;

/// Run `task` every `period` until `token` is cancelled. The first tick fires immediately.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(task = name, period_secs = period.as_secs(), "periodic task started");

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => task().await,
        }
    }

    debug!(task = name, "periodic task stopped");
}

/// Spawn autosave, auto-close, retention, and session eviction loops.
pub fn spawn_background_tasks(
    api: &Arc<RosterApi>,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let config = api.config().clone();
    let mut handles = Vec::with_capacity(4);

    let autosave_api = Arc::clone(api);
    handles.push(tokio::spawn(run_periodic(
        "autosave",
        config.autosave_interval,
        token.clone(),
        move || {
            let api = Arc::clone(&autosave_api);
            async move {
                api.autosave().await;
            }
        },
    )));

    let close_api = Arc::clone(api);
    handles.push(tokio::spawn(run_periodic(
        "auto_close",
        config.auto_close_interval,
        token.clone(),
        move || {
            let api = Arc::clone(&close_api);
            async move {
                let report = api.scan_auto_close(OffsetDateTime::now_utc()).await;
                if !report.is_empty() {
                    info!(
                        closed = report.closed.len(),
                        failed = report.failed.len(),
                        skipped = report.skipped.len(),
                        "auto-close scan finished"
                    );
                }
            }
        },
    )));

    let retention_api = Arc::clone(api);
    handles.push(tokio::spawn(run_periodic(
        "retention",
        config.retention_interval,
        token.clone(),
        move || {
            let api = Arc::clone(&retention_api);
            async move {
                let report = api.sweep_retention(OffsetDateTime::now_utc()).await;
                if !report.removed.is_empty() {
                    info!(removed = report.removed.len(), "retention sweep finished");
                }
            }
        },
    )));

    let session_api = Arc::clone(api);
    handles.push(tokio::spawn(run_periodic(
        "session_sweep",
        config.session_sweep_interval,
        token.clone(),
        move || {
            let api = Arc::clone(&session_api);
            async move {
                let evicted = api.evict_sessions(OffsetDateTime::now_utc()).await;
                if evicted > 0 {
                    debug!(evicted, "expired join sessions evicted");
                }
            }
        },
    )));

    handles
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    // Test IDs: TTASK-001
    #[tokio::test]
    async fn periodic_task_runs_until_cancelled() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let handle = {
            let runs = Arc::clone(&runs);
            tokio::spawn(run_periodic("test", Duration::from_millis(5), token.clone(), move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            }))
        };

        tokio::time::sleep(Duration::from_millis(40)).await;
        token.cancel();
        if let Err(err) = tokio::time::timeout(Duration::from_secs(1), handle).await {
            panic!("periodic task should stop after cancel: {err}");
        }

        let observed = runs.load(Ordering::SeqCst);
        assert!(observed >= 2, "expected repeated runs, saw {observed}");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), observed);
    }
}
