// Bounded-concurrency batch runner.
//
// Executes a queue of independent fallible tasks with a fixed ceiling:
// at most `limit` tasks are in flight, and as each settles the next queued
// task starts. Per-task failures are counted, never propagated; the runner
// itself always returns after every task has settled.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Aggregate result of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub total: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Run `tasks` with at most `limit` in flight.
///
/// `on_settle(done, total)` fires after every individual task settles,
/// success or failure. Completion order is arbitrary.
pub async fn run_with_limit<F>(
    tasks: Vec<F>,
    limit: usize,
    mut on_settle: impl FnMut(usize, usize),
) -> BatchOutcome
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let total = tasks.len();
    if total == 0 {
        return BatchOutcome { total: 0, failed: 0 };
    }

    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    for task in tasks {
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("batch semaphore closed");
            task.await
        });
    }

    let mut done = 0;
    let mut failed = 0;
    while let Some(joined) = set.join_next().await {
        done += 1;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                failed += 1;
                warn!(%error, "batch task failed");
            }
            Err(join_error) => {
                failed += 1;
                warn!(%join_error, "batch task panicked");
            }
        }
        on_settle(done, total);
    }

    BatchOutcome { total, failed }
}
