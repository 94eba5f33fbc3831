//! Integration tests for the conditional append engine and projections

use dcb_engine::event_store::{
    AppendCondition, AppendEvent, AppendOutcome, Cursor, EventStoreError, Query, Tag,
};
use dcb_engine::projection::{ProjectionService, StateProjector};

mod common;

fn amount_of(event: &dcb_engine::event_store::StoredEvent) -> i64 {
    serde_json::from_slice::<serde_json::Value>(&event.data)
        .ok()
        .and_then(|v| v["amount"].as_i64())
        .unwrap_or(0)
}

fn wallet_event(event_type: &str, key: &str, value: &str, amount: i64) -> AppendEvent {
    AppendEvent::new(
        event_type,
        vec![Tag::new(key, value)],
        serde_json::json!({ "amount": amount }).to_string().into_bytes(),
    )
}

#[tokio::test]
async fn test_append_batch_shares_transaction_id() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let store = common::test_store(&pool);
    let wallet = common::unique_id("w");

    let batch = vec![
        wallet_event("Deposited", "wallet_id", &wallet, 100),
        wallet_event("Withdrawn", "wallet_id", &wallet, 40),
    ];
    let outcome = store
        .append_if(&batch, &AppendCondition::none())
        .await
        .unwrap();
    let AppendOutcome::Appended { transaction_id } = outcome else {
        panic!("expected appended outcome, got {outcome:?}");
    };

    let query = Query::of_types_and_tags(
        ["Deposited", "Withdrawn"],
        vec![Tag::new("wallet_id", &wallet)],
    );
    let events = store.fetch_after(&query, 0, 10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.transaction_id == transaction_id));
    assert!(events[0].position < events[1].position);
    assert_eq!(events[0].event_type, "Deposited");
    assert_eq!(events[1].event_type, "Withdrawn");
}

#[tokio::test]
async fn test_empty_batch_is_invalid_input() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let store = common::test_store(&pool);

    let result = store.append_if(&[], &AppendCondition::none()).await;
    assert!(matches!(result, Err(EventStoreError::InvalidInput(_))));
}

#[tokio::test]
async fn test_fetch_on_empty_slice_of_log_returns_empty() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let store = common::test_store(&pool);

    let query = Query::of_types_and_tags(
        ["Nothing"],
        vec![Tag::new("nonexistent", &common::unique_id("x"))],
    );
    let events = store.fetch_after(&query, 0, 10).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_cursor_violation_detected() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let store = common::test_store(&pool);
    let wallet = common::unique_id("w");
    let query = Query::of_types_and_tags(["A"], vec![Tag::new("w", &wallet)]);

    // E1, and the cursor C1 naming it.
    store
        .append_if(
            &[wallet_event("A", "w", &wallet, 1)],
            &AppendCondition::none(),
        )
        .await
        .unwrap();
    let c1 = store.fetch_after(&query, 0, 10).await.unwrap()[0].cursor();

    // E2 arrives after the cursor was taken.
    store
        .append_if(
            &[wallet_event("A", "w", &wallet, 2)],
            &AppendCondition::none(),
        )
        .await
        .unwrap();

    let outcome = store
        .append_if(
            &[wallet_event("A", "w", &wallet, 3)],
            &AppendCondition::new(query.clone(), c1),
        )
        .await
        .unwrap();
    assert_eq!(outcome, AppendOutcome::ConcurrencyViolation);

    // E2 is the only event past the cursor.
    let events = store.fetch_after(&query, c1.position, 10).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_origin_cursor_means_no_matching_event_at_all() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let store = common::test_store(&pool);
    let wallet = common::unique_id("w");
    let query = Query::of_types_and_tags(["A"], vec![Tag::new("w", &wallet)]);

    store
        .append_if(
            &[wallet_event("A", "w", &wallet, 1)],
            &AppendCondition::none(),
        )
        .await
        .unwrap();

    let outcome = store
        .append_if(
            &[wallet_event("A", "w", &wallet, 2)],
            &AppendCondition::new(query, Cursor::origin()),
        )
        .await
        .unwrap();
    assert_eq!(outcome, AppendOutcome::ConcurrencyViolation);
}

#[tokio::test]
async fn test_idempotency_violation_on_second_append() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let store = common::test_store(&pool);
    let op = common::unique_id("op");
    let idempotency = Query::of_types_and_tags(["Paid"], vec![Tag::new("op", &op)]);

    let condition = AppendCondition::none().with_idempotency(idempotency.clone());
    let first = store
        .append_if(&[wallet_event("Paid", "op", &op, 10)], &condition)
        .await
        .unwrap();
    assert!(first.is_appended());

    let second = store
        .append_if(&[wallet_event("Paid", "op", &op, 10)], &condition)
        .await
        .unwrap();
    assert_eq!(second, AppendOutcome::IdempotencyViolation);

    let events = store.fetch_after(&idempotency, 0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_one_wins() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let store = common::test_store(&pool);
    let op = common::unique_id("op");
    let idempotency = Query::of_types_and_tags(["X"], vec![Tag::new("op", &op)]);
    let condition = AppendCondition::none().with_idempotency(idempotency.clone());

    let left_events = [wallet_event("X", "op", &op, 1)];
    let right_events = [wallet_event("X", "op", &op, 2)];
    let left = store.append_if(&left_events, &condition);
    let right = store.append_if(&right_events, &condition);
    let (left, right) = tokio::join!(left, right);
    let outcomes = [left.unwrap(), right.unwrap()];

    let appended = outcomes.iter().filter(|o| o.is_appended()).count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, AppendOutcome::IdempotencyViolation))
        .count();
    assert_eq!(appended, 1, "exactly one concurrent append must win");
    assert_eq!(duplicates, 1, "the loser must observe the duplicate");

    let events = store.fetch_after(&idempotency, 0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_projection_round_trip_in_commit_order() {
    let Some(pool) = common::try_setup_test_db().await else {
        return;
    };
    let store = common::test_store(&pool);
    let projection = ProjectionService::new(store.clone());
    let wallet = common::unique_id("w");
    let query = Query::of_types_and_tags(
        ["Deposited", "Withdrawn"],
        vec![Tag::new("wallet_id", &wallet)],
    );

    // Three appends; the store pages two at a time, so this crosses a page
    // boundary.
    for (event_type, amount) in [("Deposited", 100), ("Deposited", 50), ("Withdrawn", 30)] {
        store
            .append_if(
                &[wallet_event(event_type, "wallet_id", &wallet, amount)],
                &AppendCondition::none(),
            )
            .await
            .unwrap();
    }

    let projectors = vec![
        StateProjector::new(
            ["Deposited"],
            vec![Tag::new("wallet_id", &wallet)],
            |balance: i64, event| balance + amount_of(event),
        ),
        StateProjector::new(
            ["Withdrawn"],
            vec![Tag::new("wallet_id", &wallet)],
            |balance: i64, event| balance - amount_of(event),
        ),
    ];

    let (balance, cursor) = projection
        .project(&query, Cursor::origin(), 0, &projectors)
        .await
        .unwrap();
    assert_eq!(balance, 120);

    let events = store.fetch_after(&query, 0, 10).await.unwrap();
    assert_eq!(cursor, events.last().unwrap().cursor());

    // Projecting again after the cursor sees nothing and returns it as-is.
    let (unchanged, same_cursor) = projection
        .project(&query, cursor, 0, &projectors)
        .await
        .unwrap();
    assert_eq!(unchanged, 0);
    assert_eq!(same_cursor, cursor);
}
