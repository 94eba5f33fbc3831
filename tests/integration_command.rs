//! Integration tests for the command executor

use std::sync::Arc;

use async_trait::async_trait;

use dcb_engine::clock::system_clock;
use dcb_engine::command::{
    Command, CommandAuditStore, CommandExecutor, CommandHandler, CommandRegistry, CommandResult,
    CommandView, ExecutionResult,
};
use dcb_engine::error::{EngineError, EngineResult};
use dcb_engine::event_store::{AppendCondition, AppendEvent, Cursor, Query, Tag};
use dcb_engine::projection::{ProjectionService, StateProjector};

mod common;

#[derive(serde::Serialize, serde::Deserialize)]
struct DepositCommand {
    wallet_id: String,
    op_id: String,
    amount: i64,
}

/// Projects the wallet's deposit count, then appends one `Deposited` under
/// a fresh cursor plus an idempotency predicate on the operation id.
struct DepositHandler;

#[async_trait]
impl CommandHandler for DepositHandler {
    async fn handle(
        &self,
        view: &mut CommandView<'_, '_>,
        command: &Command,
    ) -> EngineResult<CommandResult> {
        let payload: DepositCommand = command.parse_data()?;
        let wallet_query = Query::of_types_and_tags(
            ["Deposited"],
            vec![Tag::new("wallet_id", &payload.wallet_id)],
        );

        let (_count, cursor) = view
            .project(
                &wallet_query,
                Cursor::origin(),
                0i64,
                &[StateProjector::any(|count: i64, _| count + 1)],
            )
            .await?;

        let event = AppendEvent::new(
            "Deposited",
            vec![
                Tag::new("wallet_id", &payload.wallet_id),
                Tag::new("op", &payload.op_id),
            ],
            serde_json::json!({ "amount": payload.amount })
                .to_string()
                .into_bytes(),
        );
        let condition = AppendCondition::new(wallet_query, cursor).with_idempotency(
            Query::of_types_and_tags(["Deposited"], vec![Tag::new("op", &payload.op_id)]),
        );
        Ok(CommandResult::new(vec![event], condition))
    }
}

/// Always appends from the origin cursor, so any prior matching event is a
/// conflict.
struct StaleCursorHandler;

#[async_trait]
impl CommandHandler for StaleCursorHandler {
    async fn handle(
        &self,
        _view: &mut CommandView<'_, '_>,
        command: &Command,
    ) -> EngineResult<CommandResult> {
        let payload: DepositCommand = command.parse_data()?;
        let wallet_query = Query::of_types_and_tags(
            ["Deposited"],
            vec![Tag::new("wallet_id", &payload.wallet_id)],
        );
        let event = AppendEvent::new(
            "Deposited",
            vec![
                Tag::new("wallet_id", &payload.wallet_id),
                Tag::new("op", &payload.op_id),
            ],
            Vec::new(),
        );
        Ok(CommandResult::new(
            vec![event],
            AppendCondition::new(wallet_query, Cursor::origin()),
        ))
    }
}

/// Decides up front that the operation already happened.
struct AlreadyAppliedHandler;

#[async_trait]
impl CommandHandler for AlreadyAppliedHandler {
    async fn handle(
        &self,
        _view: &mut CommandView<'_, '_>,
        _command: &Command,
    ) -> EngineResult<CommandResult> {
        Ok(CommandResult::already_applied("wallet_exists"))
    }
}

fn build_executor(
    pool: &sqlx::PgPool,
    reject_on_duplicate: &[&str],
    persist_commands: bool,
) -> CommandExecutor {
    let store = common::test_store(pool);
    let mut registry = CommandRegistry::new();
    registry.register("deposit", Arc::new(DepositHandler));
    registry.register("open_wallet", Arc::new(DepositHandler));
    registry.register("stale_deposit", Arc::new(StaleCursorHandler));
    registry.register("noop", Arc::new(AlreadyAppliedHandler));

    CommandExecutor::builder(
        store.clone(),
        ProjectionService::new(store.clone()),
        CommandAuditStore::new(pool.clone()),
        registry,
        system_clock(),
        common::noop_metrics(),
    )
    .persist_commands(persist_commands)
    .reject_on_duplicate(reject_on_duplicate.iter().copied())
    .build()
}

fn deposit_command(command_type: &str, wallet_id: &str, op_id: &str) -> Command {
    Command::new(
        command_type,
        serde_json::json!({
            "wallet_id": wallet_id,
            "op_id": op_id,
            "amount": 25
        }),
    )
}

#[tokio::test]
async fn test_command_creates_events() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let executor = build_executor(&pool, &[], false);
    let store = common::test_store(&pool);
    let wallet = common::unique_id("w");

    let result = executor
        .execute(&deposit_command("deposit", &wallet, &common::unique_id("op")))
        .await
        .unwrap();
    let ExecutionResult::Created { transaction_id } = result else {
        panic!("expected created, got {result:?}");
    };

    let query =
        Query::of_types_and_tags(["Deposited"], vec![Tag::new("wallet_id", &wallet)]);
    let events = store.fetch_after(&query, 0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].transaction_id, transaction_id);
}

#[tokio::test]
async fn test_duplicate_command_returns_idempotent() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let executor = build_executor(&pool, &[], false);
    let store = common::test_store(&pool);
    let wallet = common::unique_id("w");
    let command = deposit_command("deposit", &wallet, &common::unique_id("pay"));

    let first = executor.execute(&command).await.unwrap();
    assert!(!first.was_idempotent());

    let second = executor.execute(&command).await.unwrap();
    assert_eq!(
        second,
        ExecutionResult::Idempotent {
            reason: "duplicate_operation".into()
        }
    );

    let query =
        Query::of_types_and_tags(["Deposited"], vec![Tag::new("wallet_id", &wallet)]);
    assert_eq!(store.fetch_after(&query, 0, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reject_on_duplicate_surfaces_conflict() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let executor = build_executor(&pool, &["open_wallet"], false);
    let store = common::test_store(&pool);
    let wallet = common::unique_id("w");
    let command = deposit_command("open_wallet", &wallet, &common::unique_id("create"));

    executor.execute(&command).await.unwrap();

    let second = executor.execute(&command).await;
    assert!(matches!(
        second,
        Err(EngineError::ConcurrencyViolation { .. })
    ));

    let query =
        Query::of_types_and_tags(["Deposited"], vec![Tag::new("wallet_id", &wallet)]);
    assert_eq!(store.fetch_after(&query, 0, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_cursor_surfaces_concurrency_violation() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let executor = build_executor(&pool, &[], false);
    let wallet = common::unique_id("w");

    executor
        .execute(&deposit_command("stale_deposit", &wallet, &common::unique_id("a")))
        .await
        .unwrap();

    let second = executor
        .execute(&deposit_command("stale_deposit", &wallet, &common::unique_id("b")))
        .await;
    match second {
        Err(err @ EngineError::ConcurrencyViolation { .. }) => {
            assert!(err.is_retryable());
        }
        other => panic!("expected concurrency violation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_handler_is_invalid_command() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let executor = build_executor(&pool, &[], false);

    let result = executor
        .execute(&Command::new("unregistered", serde_json::json!({})))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidCommand { .. })));
}

#[tokio::test]
async fn test_precomputed_idempotent_outcome() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let executor = build_executor(&pool, &[], false);

    let result = executor
        .execute(&Command::new("noop", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(
        result,
        ExecutionResult::Idempotent {
            reason: "wallet_exists".into()
        }
    );
}

#[tokio::test]
async fn test_command_audit_row_written_when_enabled() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let executor = build_executor(&pool, &[], true);
    let audit = CommandAuditStore::new(pool.clone());
    let wallet = common::unique_id("w");

    let command = deposit_command("deposit", &wallet, &common::unique_id("op"))
        .with_metadata(serde_json::json!({ "correlation_id": "c-1" }));
    let result = executor.execute(&command).await.unwrap();
    let ExecutionResult::Created { transaction_id } = result else {
        panic!("expected created");
    };

    let record = audit.get(transaction_id).await.unwrap().unwrap();
    assert_eq!(record.command_type, "deposit");
    assert_eq!(record.data["wallet_id"], wallet.as_str());
    assert_eq!(
        record.metadata.unwrap()["correlation_id"],
        serde_json::json!("c-1")
    );
}
