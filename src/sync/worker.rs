use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::sync::network::NetworkMonitor;
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::transport::Transport;
use crate::sync::SyncProgress;

/// Handle to the background sync task.
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the worker after any pass in flight finishes.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            log::warn!("Sync worker ended abnormally: {e}");
        }
    }
}

/// Spawn the task that runs sync passes on a mutation signal, on a
/// reconnect edge, and every `poll` (the first tick fires immediately).
pub fn spawn<T: Transport>(
    orchestrator: Arc<SyncOrchestrator<T>>,
    monitor: Arc<NetworkMonitor>,
    trigger: Arc<Notify>,
    progress: Arc<dyn SyncProgress>,
    poll: Duration,
) -> WorkerHandle {
    let (tx, mut rx) = oneshot::channel();
    let mut connectivity = monitor.subscribe();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let reason = tokio::select! {
                _ = &mut rx => break,
                _ = trigger.notified() => "local change",
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*connectivity.borrow_and_update() {
                        continue;
                    }
                    "reconnect"
                }
                _ = ticker.tick() => "interval",
            };
            if !monitor.is_connected() {
                continue;
            }
            log::debug!("Sync pass triggered by {reason}");
            if let Err(e) = orchestrator.sync_all(progress.as_ref()).await {
                log::warn!("Sync pass failed: {e}");
            }
        }
        log::debug!("Sync worker stopped");
    });

    WorkerHandle {
        shutdown: Some(tx),
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::SystemClock;
    use crate::model::{EntityKind, OperationType};
    use crate::operation_log::OperationLog;
    use crate::storage::Database;
    use crate::sync::testing::{CountingAuth, FakeTransport};
    use crate::sync::{NoopProgress, SyncConfig};
    use serde_json::json;

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_worker_drains_on_notify_and_reconnect() {
        let db = Database::open_memory().await.unwrap();
        let clock = Arc::new(SystemClock);
        let monitor = Arc::new(NetworkMonitor::new(false));
        let config = SyncConfig {
            poll_interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        };
        let orch = Arc::new(SyncOrchestrator::new(
            db.clone(),
            FakeTransport::new(),
            Arc::new(CountingAuth::default()),
            monitor.clone(),
            clock.clone(),
            &config,
        ));
        let log = OperationLog::new(db.clone(), clock, config.max_retries);
        let trigger = Arc::new(Notify::new());
        let handle = spawn(
            orch.clone(),
            monitor.clone(),
            trigger.clone(),
            Arc::new(NoopProgress),
            config.poll_interval,
        );

        // Offline: a notify does nothing
        log.enqueue(OperationType::Delete, EntityKind::Task, "S1", json!(null))
            .await
            .unwrap();
        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orch.transport().calls().is_empty());

        // Reconnect drains the queue
        monitor.set_connected(true);
        wait_until(|| {
            let log = log.clone();
            async move { log.list_queued().await.unwrap().is_empty() }
        })
        .await;
        assert_eq!(orch.transport().calls().len(), 1);

        // A later mutation is picked up through the notify
        log.enqueue(OperationType::Delete, EntityKind::Project, "S2", json!(null))
            .await
            .unwrap();
        trigger.notify_one();
        wait_until(|| {
            let log = log.clone();
            async move { log.list_queued().await.unwrap().is_empty() }
        })
        .await;
        assert_eq!(orch.transport().calls().len(), 2);

        handle.shutdown().await;
    }
}
