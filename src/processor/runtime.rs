//! Processor runtime
//!
//! Owns the workers of one subsystem (outbox or views), the shared leader
//! elector's retry loop, and the operational surface: list, pause, resume,
//! reset, lag, backoff inspection. All operational calls are idempotent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::EngineResult;
use crate::event_store::EventStore;

use super::backoff::BackoffSnapshot;
use super::leader::LeaderElector;
use super::progress::{ProcessorProgress, ProcessorStatus, ProgressStore};
use super::worker::ProcessorWorker;
use super::ProcessorId;

/// One processor's row joined with its live scheduling state
#[derive(Debug, Clone)]
pub struct ProcessorOverview {
    pub progress: ProcessorProgress,
    pub lag: i64,
    pub backoff: Option<BackoffSnapshot>,
}

/// Runtime for one subsystem's processors
pub struct ProcessorRuntime {
    store: EventStore,
    progress: ProgressStore,
    leader: Arc<LeaderElector>,
    leader_retry_interval: Duration,
    workers: Vec<Arc<ProcessorWorker>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ProcessorRuntime {
    pub fn new(
        store: EventStore,
        progress: ProgressStore,
        leader: Arc<LeaderElector>,
        leader_retry_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            progress,
            leader,
            leader_retry_interval,
            workers: Vec::new(),
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    pub fn add_worker(&mut self, worker: Arc<ProcessorWorker>) {
        self.workers.push(worker);
    }

    pub fn workers(&self) -> &[Arc<ProcessorWorker>] {
        &self.workers
    }

    /// Spawn the leader retry scheduler and one loop per enabled worker
    pub fn start(&mut self) {
        self.handles.push(self.spawn_leader_retry());
        for worker in &self.workers {
            if !worker.config().enabled {
                tracing::info!(processor_id = %worker.id(), "processor disabled; not scheduling");
                continue;
            }
            self.handles.push(worker.spawn(self.shutdown_rx.clone()));
        }
        tracing::info!(
            workers = self.workers.len(),
            table = self.progress.table(),
            "processor runtime started"
        );
    }

    // A follower takes over within one retry interval of a leader crash.
    fn spawn_leader_retry(&self) -> JoinHandle<()> {
        let leader = Arc::clone(&self.leader);
        let interval = self.leader_retry_interval;
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = leader.try_acquire().await {
                            tracing::warn!(error = %err, "leader retry probe failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Signal the loops, wait for in-flight ticks, release the lease
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "processor task join failed");
            }
        }
        self.leader.release().await;
        tracing::info!(table = self.progress.table(), "processor runtime stopped");
    }

    // =========================================================================
    // Operational surface
    // =========================================================================

    pub async fn list_processors(&self) -> EngineResult<Vec<ProcessorOverview>> {
        let head = self.store.head_position().await?;
        let rows = self.progress.list().await?;
        Ok(rows
            .into_iter()
            .map(|progress| {
                let backoff = self.backoff_snapshot(&progress.processor_id);
                ProcessorOverview {
                    lag: (head - progress.last_position).max(0),
                    backoff,
                    progress,
                }
            })
            .collect())
    }

    pub async fn pause(&self, id: &ProcessorId) -> EngineResult<()> {
        self.progress.set_status(id, ProcessorStatus::Paused).await?;
        tracing::info!(processor_id = %id, "processor paused");
        Ok(())
    }

    pub async fn resume(&self, id: &ProcessorId) -> EngineResult<()> {
        self.progress.set_status(id, ProcessorStatus::Active).await?;
        tracing::info!(processor_id = %id, "processor resumed");
        Ok(())
    }

    /// Clear errors and return a failed processor to `active`
    pub async fn reset(&self, id: &ProcessorId) -> EngineResult<()> {
        self.progress.reset(id).await?;
        tracing::info!(processor_id = %id, "processor reset");
        Ok(())
    }

    /// `max(position in log) - last_position`, never negative
    pub async fn lag(&self, id: &ProcessorId) -> EngineResult<i64> {
        let head = self.store.head_position().await?;
        let last = self.progress.get_last_position(id).await?;
        Ok((head - last).max(0))
    }

    /// Live backoff state for a scheduled worker, if this runtime owns it
    pub fn backoff_snapshot(&self, id: &ProcessorId) -> Option<BackoffSnapshot> {
        self.workers
            .iter()
            .find(|w| w.id() == id)
            .map(|w| w.backoff_snapshot())
    }
}
