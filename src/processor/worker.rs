//! Processor worker
//!
//! Owns one processor's scheduled poll loop: leadership gate, backoff gate,
//! then a single fetch/handle/advance cycle. A tick is never re-entered;
//! the loop awaits each cycle before selecting again.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::EngineResult;
use crate::metrics::{MetricEvent, SharedMetrics};

use super::backoff::{BackoffSnapshot, BackoffState};
use super::config::ProcessorConfig;
use super::leader::LeaderElector;
use super::progress::{ProcessorStatus, ProgressStore};
use super::EventProcessor;

/// Scheduled worker around one `EventProcessor`
pub struct ProcessorWorker {
    processor: Arc<dyn EventProcessor>,
    config: ProcessorConfig,
    progress: ProgressStore,
    leader: Arc<LeaderElector>,
    metrics: SharedMetrics,
    backoff: Mutex<BackoffState>,
}

impl ProcessorWorker {
    pub fn new(
        processor: Arc<dyn EventProcessor>,
        config: ProcessorConfig,
        progress: ProgressStore,
        leader: Arc<LeaderElector>,
        metrics: SharedMetrics,
    ) -> Self {
        let backoff = Mutex::new(BackoffState::new(
            config.backoff.clone(),
            config.polling_interval,
        ));
        Self {
            processor,
            config,
            progress,
            leader,
            metrics,
            backoff,
        }
    }

    pub fn id(&self) -> &super::ProcessorId {
        self.processor.id()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Current backoff state, for the operational surface
    pub fn backoff_snapshot(&self) -> BackoffSnapshot {
        self.lock_backoff().snapshot()
    }

    /// Ensure the progress row exists
    pub async fn register(&self) -> EngineResult<()> {
        self.progress
            .auto_register(self.id(), self.leader.instance_id())
            .await?;
        Ok(())
    }

    /// One scheduler tick: leadership gate, backoff gate, then a cycle
    pub async fn tick(&self) -> EngineResult<usize> {
        let is_leader = match self.leader.maybe_acquire().await {
            Ok(leader) => leader,
            Err(err) => {
                tracing::warn!(processor_id = %self.id(), error = %err, "leader probe failed");
                false
            }
        };
        if !is_leader {
            return Ok(0);
        }

        if !self.lock_backoff().should_run() {
            return Ok(0);
        }

        if let Err(err) = self
            .progress
            .heartbeat(self.id(), self.leader.instance_id())
            .await
        {
            tracing::warn!(processor_id = %self.id(), error = %err, "heartbeat update failed");
        }

        self.run_cycle().await
    }

    /// One fetch/handle/advance cycle, leadership already established
    pub async fn run_cycle(&self) -> EngineResult<usize> {
        let id = self.id().clone();

        let status = self.progress.get_status(&id).await?;
        if status != ProcessorStatus::Active {
            return Ok(0);
        }

        let last_position = self.progress.get_last_position(&id).await?;
        let events = self
            .processor
            .fetch(last_position, self.config.batch_size)
            .await?;

        let Some(last_event) = events.last() else {
            let consecutive = {
                let mut backoff = self.lock_backoff();
                backoff.record_empty();
                backoff.consecutive_empty()
            };
            self.metrics.observe(&MetricEvent::EmptyPoll {
                processor_id: id,
                consecutive,
            });
            return Ok(0);
        };
        let batch_end = last_event.position;

        match self.processor.handle(&events).await {
            Ok(delivered) => {
                self.progress.update_progress(&id, batch_end).await?;
                self.progress.reset_error_count(&id).await?;
                self.lock_backoff().reset();
                self.metrics.observe(&MetricEvent::CycleCompleted {
                    processor_id: id,
                    delivered,
                });
                Ok(delivered)
            }
            Err(err) => {
                // Backoff is deliberately untouched: an erroring processor
                // keeps its normal cadence so recovery is retried promptly.
                let status = self
                    .progress
                    .record_error(&id, &err.to_string(), self.config.max_errors)
                    .await?;
                self.metrics.observe(&MetricEvent::CycleFailed {
                    processor_id: id.clone(),
                });
                if status == ProcessorStatus::Failed {
                    self.metrics.observe(&MetricEvent::ProcessorFailed {
                        processor_id: id,
                        error_count: self.config.max_errors,
                    });
                }
                Err(err)
            }
        }
    }

    /// Spawn the periodic loop; cancelled via the shutdown channel between
    /// ticks, never mid-cycle
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = worker.register().await {
                tracing::error!(processor_id = %worker.id(), error = %err, "progress registration failed");
            }

            let mut ticker = tokio::time::interval(worker.config.polling_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match worker.tick().await {
                            Ok(delivered) if delivered > 0 => {
                                tracing::debug!(processor_id = %worker.id(), delivered, "cycle delivered events");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::error!(processor_id = %worker.id(), error = %err, "processor cycle failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!(processor_id = %worker.id(), "processor loop stopping");
                        break;
                    }
                }
            }
        })
    }

    fn lock_backoff(&self) -> MutexGuard<'_, BackoffState> {
        self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
