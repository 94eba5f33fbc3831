//! Command Executor
//!
//! Orchestrates one transaction per command: projection, handler, result
//! validation, conditional append, optional audit row, commit.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::{Postgres, Transaction};

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::event_store::{AppendOutcome, Cursor, EventStore, Query};
use crate::metrics::{MetricEvent, SharedMetrics};
use crate::projection::{ProjectionService, StateProjector};

use super::audit::CommandAuditStore;
use super::registry::{CommandHandler, CommandRegistry};
use super::{Command, CommandResult};

/// Outcome of a command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Events were appended under this transaction id
    Created { transaction_id: i64 },
    /// The operation had already been recorded; nothing was appended
    Idempotent { reason: String },
}

impl ExecutionResult {
    pub fn was_idempotent(&self) -> bool {
        matches!(self, ExecutionResult::Idempotent { .. })
    }
}

/// Transaction-scoped view handed to command handlers
///
/// Wraps the command's transaction so every projection a handler runs sees
/// the same snapshot the append condition will be evaluated against.
pub struct CommandView<'a, 'tx> {
    tx: &'a mut Transaction<'tx, Postgres>,
    projection: &'a ProjectionService,
}

impl CommandView<'_, '_> {
    /// Project decision state from the log inside this transaction
    pub async fn project<S>(
        &mut self,
        query: &Query,
        after: Cursor,
        initial: S,
        projectors: &[StateProjector<S>],
    ) -> EngineResult<(S, Cursor)> {
        Ok(self
            .projection
            .project_in_tx(self.tx, query, after, initial, projectors)
            .await?)
    }
}

enum Disposition {
    Commit(ExecutionResult),
    Abort(ExecutionResult),
}

/// Executes commands against the event store
#[derive(Clone)]
pub struct CommandExecutor {
    store: EventStore,
    projection: ProjectionService,
    audit: CommandAuditStore,
    registry: CommandRegistry,
    clock: SharedClock,
    metrics: SharedMetrics,
    persist_commands: bool,
    reject_on_duplicate: HashSet<String>,
}

impl CommandExecutor {
    pub fn builder(
        store: EventStore,
        projection: ProjectionService,
        audit: CommandAuditStore,
        registry: CommandRegistry,
        clock: SharedClock,
        metrics: SharedMetrics,
    ) -> CommandExecutorBuilder {
        CommandExecutorBuilder {
            executor: CommandExecutor {
                store,
                projection,
                audit,
                registry,
                clock,
                metrics,
                persist_commands: false,
                reject_on_duplicate: HashSet::new(),
            },
        }
    }

    /// Execute one command in one transaction
    pub async fn execute(&self, command: &Command) -> EngineResult<ExecutionResult> {
        let handler = self.registry.resolve(&command.command_type).ok_or_else(|| {
            EngineError::InvalidCommand {
                command_type: command.command_type.clone(),
                reason: "no handler registered".into(),
            }
        })?;

        let mut tx = self.store.begin().await?;
        match self.run(&mut tx, handler, command).await {
            Ok(Disposition::Commit(result)) => {
                tx.commit().await?;
                self.observe(command, &result);
                Ok(result)
            }
            Ok(Disposition::Abort(result)) => {
                tx.rollback().await?;
                self.observe(command, &result);
                Ok(result)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after command failure failed");
                }
                tracing::debug!(
                    command_type = %command.command_type,
                    kind = err.kind(),
                    "command execution failed"
                );
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        handler: Arc<dyn CommandHandler>,
        command: &Command,
    ) -> EngineResult<Disposition> {
        let result = {
            let mut view = CommandView {
                tx: &mut *tx,
                projection: &self.projection,
            };
            handler.handle(&mut view, command).await?
        };
        result.validate()?;

        if result.events.is_empty() {
            // The handler already determined the operation is a duplicate.
            let reason = reason_or_default(result);
            return Ok(Disposition::Abort(ExecutionResult::Idempotent { reason }));
        }

        let outcome = self
            .store
            .append_if_in_tx(tx, &result.events, &result.condition)
            .await?;

        match outcome {
            AppendOutcome::Appended { transaction_id } => {
                if self.persist_commands {
                    self.audit
                        .record_in_tx(tx, transaction_id, command, self.clock.now())
                        .await?;
                }
                self.metrics.observe(&MetricEvent::AppendCompleted {
                    transaction_id,
                    batch_size: result.events.len(),
                });
                Ok(Disposition::Commit(ExecutionResult::Created {
                    transaction_id,
                }))
            }
            AppendOutcome::IdempotencyViolation => {
                self.metrics.observe(&MetricEvent::AppendRejected {
                    outcome: "idempotency_violation",
                });
                if self.reject_on_duplicate.contains(&command.command_type) {
                    // Creation-style commands must see a conflict, not a
                    // quiet duplicate.
                    Err(EngineError::ConcurrencyViolation {
                        command_type: Some(command.command_type.clone()),
                    })
                } else {
                    Ok(Disposition::Abort(ExecutionResult::Idempotent {
                        reason: "duplicate_operation".into(),
                    }))
                }
            }
            AppendOutcome::ConcurrencyViolation => {
                self.metrics.observe(&MetricEvent::AppendRejected {
                    outcome: "concurrency_violation",
                });
                Err(EngineError::ConcurrencyViolation {
                    command_type: Some(command.command_type.clone()),
                })
            }
        }
    }

    fn observe(&self, command: &Command, result: &ExecutionResult) {
        self.metrics.observe(&MetricEvent::CommandExecuted {
            command_type: command.command_type.clone(),
            idempotent: result.was_idempotent(),
        });
    }
}

fn reason_or_default(result: CommandResult) -> String {
    result
        .idempotent_reason
        .unwrap_or_else(|| "duplicate_operation".into())
}

/// Builder for executor policy knobs
pub struct CommandExecutorBuilder {
    executor: CommandExecutor,
}

impl CommandExecutorBuilder {
    /// Record command audit rows alongside appended events
    pub fn persist_commands(mut self, enabled: bool) -> Self {
        self.executor.persist_commands = enabled;
        self
    }

    /// Command types whose duplicates surface as concurrency violations
    pub fn reject_on_duplicate<I, T>(mut self, command_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.executor.reject_on_duplicate =
            command_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> CommandExecutor {
        self.executor
    }
}
