use std::sync::Arc;

use tokio::sync::Semaphore;

use tether_protocol::{SyncHandler, Value};
use tether_std::errors::RemoteError;

/// Slots in the process-wide blocking pool shared by every connection.
pub(crate) const BLOCKING_WORKERS: usize = 32;

/// Gate in front of `spawn_blocking` so WORKER handlers across all
/// connections compete for a fixed number of threads.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(BLOCKING_WORKERS)
    }
}

impl WorkerPool {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(slots)),
        }
    }

    pub(crate) async fn run(
        &self,
        handler: SyncHandler,
        args: Vec<Value>,
    ) -> Result<Value, RemoteError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::RemoteInternal("worker pool closed".into()))?;

        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            handler(args)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(err) => Err(RemoteError::RemoteInternal(format!(
                "worker task failed: {err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_bounds_parallelism() {
        let pool = WorkerPool::new(2);
        let current = StdArc::new(AtomicUsize::new(0));
        let peak = StdArc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let current = current.clone();
            let peak = peak.clone();
            let handler: SyncHandler = StdArc::new(move |_args| {
                let running = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Nil)
            });
            tasks.push(tokio::spawn(async move { pool.run(handler, vec![]).await }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let pool = WorkerPool::new(1);
        let handler: SyncHandler = StdArc::new(|_args| panic!("boom"));
        let err = pool.run(handler, vec![]).await.unwrap_err();
        assert_eq!(err.code(), 500);
    }
}
