use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::error::{Result, UpgradeError};

pub const DEFAULT_WORKERS: usize = 4;

/// Fixed-size pool for blocking per-file work.
///
/// A semaphore of `workers` permits gates dispatch, so at most `workers`
/// tasks run at any instant; `run` is the completion barrier. Once the
/// cancel token fires, no further tasks are dispatched; in-flight tasks
/// observe the token themselves at their next chunk boundary.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

pub type Task<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(UpgradeError::TaskFailed(
                "worker pool requires at least one worker".into(),
            ));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run all tasks, wait for every one of them, and collate failures:
    /// the first error propagates, later ones are chained for diagnostics.
    pub async fn run<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        cancel: &CancelToken,
    ) -> Result<Vec<T>> {
        let mut set = JoinSet::new();
        let mut errors: Vec<UpgradeError> = Vec::new();

        for task in tasks {
            if cancel.is_cancelled() {
                errors.push(UpgradeError::Cancelled);
                break;
            }
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| UpgradeError::TaskFailed(e.to_string()))?;
            set.spawn_blocking(move || {
                let _permit = permit;
                task()
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(UpgradeError::TaskFailed(e.to_string())),
            }
        }

        match UpgradeError::collate(errors) {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}
