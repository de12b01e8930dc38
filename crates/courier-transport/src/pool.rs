//! Worker pool coordination.
//!
//! Fans a single input channel out to N symmetric delivery workers that share one
//! registrar channel. The pool owns worker identity assignment and the
//! cancellation handle; it imposes no ordering across workers.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::batch::Batch;
use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::codec::Event;
use crate::config::TransportConfig;
use crate::connector::{Connector, Dialer, ServerPool};
use crate::error::{Result, TransportError};
use crate::metrics::DeliveryMetrics;
use crate::worker::{DeliveryWorker, WorkerExit, WorkerId};

/// Supervises a set of delivery workers.
pub struct WorkerPool {
    config: Arc<TransportConfig>,
    servers: ServerPool,
    dialer: Arc<dyn Dialer>,
    metrics: Arc<DeliveryMetrics>,
    cancel_token: CancelToken,
    cancel_handle: CancelHandle,
    next_id: u32,
    workers: Vec<(WorkerId, JoinHandle<Result<WorkerExit>>)>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("servers", &self.servers)
            .field("workers", &self.workers.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl WorkerPool {
    /// Creates an empty pool. The server list must be non-empty.
    pub fn new(config: TransportConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        let servers = ServerPool::new(config.servers.clone())?;
        let (cancel_token, cancel_handle) = new_cancel_pair();
        Ok(Self {
            config: Arc::new(config),
            servers,
            dialer,
            metrics: Arc::new(DeliveryMetrics::new()),
            cancel_token,
            cancel_handle,
            next_id: 0,
            workers: Vec::new(),
        })
    }

    /// Spawns `count` workers sharing `input` and `registrar`.
    ///
    /// Each worker gets the next identity from the pool's counter, so identities
    /// stay distinct across repeated calls. Must be called within a tokio runtime.
    pub fn spawn<E: Event>(
        &mut self,
        count: usize,
        input: mpsc::Receiver<Batch<E>>,
        registrar: mpsc::Sender<Batch<E>>,
    ) -> Result<Vec<WorkerId>> {
        if count == 0 {
            return Err(TransportError::Config {
                reason: "worker count must be at least 1".to_string(),
            });
        }

        tracing::info!(worker_count = count, servers = self.servers.len(), "spawning delivery workers");
        let input = Arc::new(Mutex::new(input));
        let mut spawned = Vec::with_capacity(count);

        for _ in 0..count {
            let id = WorkerId(self.next_id);
            self.next_id += 1;

            let connector = Connector::new(
                self.dialer.clone(),
                self.servers.clone(),
                self.config.timeout(),
                self.metrics.clone(),
            );
            let worker = DeliveryWorker::new(
                id,
                connector,
                &self.config,
                self.metrics.clone(),
                self.cancel_token.clone(),
            );
            let input = input.clone();
            let registrar = registrar.clone();

            let handle = tokio::spawn(async move {
                tracing::info!(worker = %id, "delivery worker starting");
                let result = worker.run(input, registrar).await;
                if let Err(ref error) = result {
                    tracing::error!(worker = %id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.workers.push((id, handle));
            spawned.push(id);
        }

        Ok(spawned)
    }

    /// Metrics shared by every worker of this pool.
    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        self.metrics.clone()
    }

    /// Handle that cancels every worker, e.g. from a signal handler.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel_handle.clone()
    }

    /// Token observing this pool's cancellation, for tasks feeding the pool.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel_token.clone()
    }

    /// Identities of the workers spawned so far.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|(id, _)| *id).collect()
    }

    /// Waits for every worker to exit. Workers drain once all input senders are
    /// dropped. Returns the first worker error after all have stopped.
    pub async fn join(self) -> Result<Vec<(WorkerId, WorkerExit)>> {
        let mut exits = Vec::with_capacity(self.workers.len());
        let mut first_error = None;

        for (id, handle) in self.workers {
            match handle.await {
                Ok(Ok(exit)) => exits.push((id, exit)),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    first_error.get_or_insert(TransportError::WorkerFailed {
                        worker: id.0,
                        reason: join_error.to_string(),
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(workers = exits.len(), "all delivery workers stopped");
                Ok(exits)
            }
        }
    }

    /// Cancels every worker and waits for them to stop. Batches still in flight are
    /// not forwarded to the registrar.
    pub async fn shutdown(self, reason: CancelReason) -> Result<Vec<(WorkerId, WorkerExit)>> {
        tracing::info!(reason = %reason, "shutting down delivery workers");
        self.cancel_handle.cancel(reason);
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl Dialer for Unreachable {
        async fn dial(&self, _addr: &str, _timeout: Duration) -> Result<Connection> {
            Err(TransportError::IoError(std::io::ErrorKind::ConnectionRefused.into()))
        }
    }

    #[derive(Debug)]
    struct Nothing;

    impl Event for Nothing {
        fn serialize(&self, _sequence: u32, _sink: &mut dyn std::io::Write) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn config() -> TransportConfig {
        TransportConfig::new(vec!["a:1".to_string(), "b:2".to_string()])
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let result = WorkerPool::new(TransportConfig::default(), Arc::new(Unreachable));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let mut pool = WorkerPool::new(config(), Arc::new(Unreachable)).unwrap();
        let (_tx, rx) = mpsc::channel::<Batch<Nothing>>(1);
        let (reg_tx, _reg_rx) = mpsc::channel(1);
        assert!(pool.spawn(0, rx, reg_tx).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_distinct_across_spawns() {
        let mut pool = WorkerPool::new(config(), Arc::new(Unreachable)).unwrap();

        let (_tx1, rx1) = mpsc::channel::<Batch<Nothing>>(1);
        let (reg_tx, _reg_rx) = mpsc::channel(1);
        let first = pool.spawn(3, rx1, reg_tx.clone()).unwrap();
        let (_tx2, rx2) = mpsc::channel::<Batch<Nothing>>(1);
        let second = pool.spawn(2, rx2, reg_tx).unwrap();

        assert_eq!(first, vec![WorkerId(0), WorkerId(1), WorkerId(2)]);
        assert_eq!(second, vec![WorkerId(3), WorkerId(4)]);
        assert_eq!(pool.worker_ids().len(), 5);

        let exits = pool.shutdown(CancelReason::Shutdown).await.unwrap();
        assert_eq!(exits.len(), 5);
        assert!(exits.iter().all(|(_, exit)| *exit == WorkerExit::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unblocks_unreachable_pool() {
        let mut pool = WorkerPool::new(config(), Arc::new(Unreachable)).unwrap();
        let metrics = pool.metrics();
        let (tx, rx) = mpsc::channel::<Batch<Nothing>>(1);
        let (reg_tx, _reg_rx) = mpsc::channel(1);
        pool.spawn(2, rx, reg_tx).unwrap();
        tx.send(Batch::new(vec![Nothing])).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(metrics.snapshot().connect_failures >= 10);

        let exits = pool.shutdown(CancelReason::Signal).await.unwrap();
        assert_eq!(exits.len(), 2);
    }
}
