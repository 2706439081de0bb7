use super::snapshot::SnapshotManager;
use crate::storage::StorageEngine;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// Background worker that snapshots the store whenever it changed
pub struct SnapshotWorker {
    engine: Arc<StorageEngine>,
    manager: Arc<SnapshotManager>,
    interval: Duration,
    running: Arc<AtomicBool>,
    /// Revision covered by the last successful snapshot
    last_revision: AtomicU64,
}

impl SnapshotWorker {
    /// Worker ticking at the manager's configured snapshot interval
    pub fn new(engine: Arc<StorageEngine>, manager: Arc<SnapshotManager>) -> Self {
        let secs = manager.config().snapshot_interval_secs.max(1);
        Self::with_interval(engine, manager, Duration::from_secs(secs))
    }

    pub fn with_interval(
        engine: Arc<StorageEngine>,
        manager: Arc<SnapshotManager>,
        interval: Duration,
    ) -> Self {
        let last_revision = AtomicU64::new(engine.revision());
        Self {
            engine,
            manager,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            last_revision,
        }
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("Snapshot worker started with interval {:?}", self.interval);

            let mut interval = time::interval(self.interval);
            // The first tick completes immediately
            interval.tick().await;

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;

                let worker = Arc::clone(&self);
                if let Err(e) = tokio::task::spawn_blocking(move || worker.snapshot_if_changed()).await {
                    tracing::warn!("Snapshot task panicked: {}", e);
                }
            }

            tracing::info!("Snapshot worker stopped");
        })
    }

    /// Write a snapshot if the store changed since the last one.
    /// Returns whether a snapshot was written.
    pub fn snapshot_if_changed(&self) -> bool {
        let revision = self.engine.revision();
        if revision == self.last_revision.load(Ordering::SeqCst) {
            return false;
        }

        match self.manager.create_snapshot(&self.engine) {
            Ok(meta) => {
                self.last_revision.store(meta.revision, Ordering::SeqCst);
                tracing::info!(
                    "Snapshot written: {} buckets, {} events, {} bytes",
                    meta.buckets,
                    meta.events,
                    meta.size_bytes
                );
                true
            }
            Err(e) => {
                tracing::warn!("Failed to write snapshot: {}", e);
                false
            }
        }
    }

    /// Stop the worker
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
