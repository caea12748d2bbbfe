//! Queue-and-await-previous serial runner.
//!
//! A `SerialRunner` guards one logical resource (a track, a participant).
//! Work submitted through [`SerialRunner::run`] waits for every earlier
//! submission on the same runner to finish, in submission order, so no two
//! transitions on that resource ever overlap. Separate runners are
//! independent.

use std::future::Future;
use tokio::sync::Mutex;

/// Single-flight executor for one resource.
#[derive(Debug, Default)]
pub struct SerialRunner {
    gate: Mutex<()>,
}

impl SerialRunner {
    /// Create an idle runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` once all previously submitted work has finished.
    ///
    /// Waiters are admitted in FIFO order.
    pub async fn run<F, T>(&self, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.gate.lock().await;
        work.await
    }

    /// Whether some work currently holds the runner.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test(start_paused = true)]
    async fn test_runs_never_overlap_and_keep_order() {
        let runner = Arc::new(SerialRunner::new());
        let log = Arc::new(AsyncMutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..4u64 {
            let runner = Arc::clone(&runner);
            let log = Arc::clone(&log);
            tasks.push(tokio::spawn(async move {
                runner
                    .run(async {
                        log.lock().await.push(format!("enter-{i}"));
                        tokio::time::sleep(Duration::from_millis(10 * (4 - i))).await;
                        log.lock().await.push(format!("exit-{i}"));
                    })
                    .await;
            }));
            // Make submission order deterministic.
            tokio::task::yield_now().await;
        }

        for task in tasks {
            task.await.unwrap();
        }

        let log = log.lock().await;
        let expected: Vec<String> = (0..4)
            .flat_map(|i| [format!("enter-{i}"), format!("exit-{i}")])
            .collect();
        assert_eq!(*log, expected);
    }

    #[tokio::test]
    async fn test_returns_work_output() {
        let runner = SerialRunner::new();
        let value = runner.run(async { 5 + 5 }).await;
        assert_eq!(value, 10);
        assert!(!runner.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_runners_progress_concurrently() {
        let first = Arc::new(SerialRunner::new());
        let second = SerialRunner::new();

        let blocker = {
            let first = Arc::clone(&first);
            tokio::spawn(async move {
                first
                    .run(tokio::time::sleep(Duration::from_secs(60)))
                    .await;
            })
        };
        tokio::task::yield_now().await;

        assert!(first.is_busy());
        let done = tokio::time::timeout(Duration::from_secs(1), second.run(async { 1 })).await;
        assert_eq!(done.unwrap(), 1);

        blocker.abort();
    }
}
