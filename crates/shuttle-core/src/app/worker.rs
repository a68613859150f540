use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::engine::{Queue, RunSummary};
use crate::app::handler::JobHandler;
use crate::domain::QueueError;
use crate::ports::Broker;

/// Worker group handle.
/// - 1 ワーカー = 1 エンジン = 1 接続。並列度はエンジンを増やして得る
/// - `shutdown_tx` を drop するとワーカー全体が止まる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<Result<RunSummary, QueueError>>>,
}

impl WorkerGroup {
    /// Spawn `n` workers. `make_queue(worker_id)` builds each worker's own engine.
    pub fn spawn<B, F>(n: usize, mut make_queue: F, handler: Arc<dyn JobHandler>) -> Self
    where
        B: Broker + 'static,
        F: FnMut(usize) -> Queue<B>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let queue = make_queue(worker_id);
            let handler = Arc::clone(&handler);
            let rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                let result = queue.listen(handler.as_ref(), rx).await;
                if let Err(e) = queue.close().await {
                    warn!(worker_id, error = %e, "close failed");
                }
                match &result {
                    Ok(summary) => info!(worker_id, processed = summary.processed, "worker exited"),
                    Err(e) => warn!(worker_id, error = %e, "worker stopped on error"),
                }
                result
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all workers.
    /// In-flight handlers are not cancelled; workers stop before the next delivery.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers, one result per worker.
    pub async fn shutdown_and_join(self) -> Vec<Result<RunSummary, QueueError>> {
        self.request_shutdown();
        let mut results = Vec::with_capacity(self.joins.len());
        for join in self.joins {
            results.push(match join.await {
                Ok(result) => result,
                Err(e) => Err(QueueError::Worker(e.to_string())),
            });
        }
        results
    }
}
