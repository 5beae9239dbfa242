//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p transaction-log --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use transaction_log::{
    InstanceHeader, InstanceId, InstanceQuery, PostgresTransactionLog, RecordPhase, Sequence,
    StepExecutionRecord, TransactionLog, TransactionLogError, TransactionLogExt, WorkflowStatus,
};

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_workflow_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh log with its own pool and cleared tables
async fn get_test_log() -> PostgresTransactionLog {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE step_records, workflow_instances")
        .execute(&pool)
        .await
        .unwrap();

    PostgresTransactionLog::new(pool)
}

fn new_header() -> InstanceHeader {
    InstanceHeader::new(
        InstanceId::new(),
        "createShipmentWorkflow",
        serde_json::json!({"fulfillment_id": "ful_01", "items": [{"sku": "SKU-1", "quantity": 2}]}),
    )
}

fn pending(seq: i64, step: &str) -> StepExecutionRecord {
    StepExecutionRecord::pending(Sequence::new(seq), RecordPhase::Invoke, step, format!("{step}:k"))
}

fn succeeded(seq: i64, step: &str, output: serde_json::Value) -> StepExecutionRecord {
    StepExecutionRecord::succeeded(Sequence::new(seq), step, format!("{step}:k"), output, 1)
}

#[tokio::test]
async fn create_and_load_instance() {
    let log = get_test_log().await;
    let header = new_header();
    let id = header.instance_id;

    log.create_instance(header.clone()).await.unwrap();

    let loaded = log.load_instance(id).await.unwrap().unwrap();
    assert_eq!(loaded.header.definition_id, "createShipmentWorkflow");
    assert_eq!(loaded.header.input, header.input);
    assert_eq!(loaded.status(), WorkflowStatus::Running);
    assert!(loaded.records.is_empty());
}

#[tokio::test]
async fn duplicate_instance_is_rejected() {
    let log = get_test_log().await;
    let header = new_header();

    log.create_instance(header.clone()).await.unwrap();
    let result = log.create_instance(header).await;
    assert!(matches!(result, Err(TransactionLogError::InstanceExists(_))));
}

#[tokio::test]
async fn records_are_reconstructed_in_sequence_order() {
    let log = get_test_log().await;
    let header = new_header();
    let id = header.instance_id;
    log.create_instance(header).await.unwrap();

    log.append_record(id, pending(1, "reserveInventory")).await.unwrap();
    log.append_record(
        id,
        succeeded(2, "reserveInventory", serde_json::json!({"reservation_id": "RES-0001"})),
    )
    .await
    .unwrap();
    log.append_record(id, pending(3, "createCarrierLabel")).await.unwrap();
    log.append_record(
        id,
        StepExecutionRecord::failed(
            Sequence::new(4),
            RecordPhase::Invoke,
            "createCarrierLabel",
            "createCarrierLabel:k",
            "carrier unavailable",
            3,
        ),
    )
    .await
    .unwrap();

    let loaded = log.require_instance(id).await.unwrap();
    assert_eq!(loaded.records.len(), 4);
    let sequences: Vec<i64> = loaded.records.iter().map(|r| r.sequence.as_i64()).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert_eq!(
        loaded.succeeded_output("reserveInventory:k"),
        Some(&serde_json::json!({"reservation_id": "RES-0001"}))
    );
    assert_eq!(loaded.records[3].attempts, 3);
    assert_eq!(loaded.records[3].error.as_deref(), Some("carrier unavailable"));
}

#[tokio::test]
async fn sequence_conflict_is_detected() {
    let log = get_test_log().await;
    let header = new_header();
    let id = header.instance_id;
    log.create_instance(header).await.unwrap();

    log.append_record(id, pending(1, "reserveInventory")).await.unwrap();
    let result = log
        .append_record(id, succeeded(3, "reserveInventory", serde_json::json!({})))
        .await;

    assert!(matches!(
        result,
        Err(TransactionLogError::SequenceConflict { .. })
    ));
}

#[tokio::test]
async fn second_open_pending_is_rejected() {
    let log = get_test_log().await;
    let header = new_header();
    let id = header.instance_id;
    log.create_instance(header).await.unwrap();

    log.append_record(id, pending(1, "reserveInventory")).await.unwrap();
    let result = log.append_record(id, pending(2, "createCarrierLabel")).await;

    assert!(matches!(result, Err(TransactionLogError::InvalidRecord { .. })));
}

#[tokio::test]
async fn concurrent_appends_to_different_instances() {
    let log = get_test_log().await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        let header = new_header();
        ids.push(header.instance_id);
        log.create_instance(header).await.unwrap();
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            log.append_record(id, pending(1, "reserveInventory")).await?;
            log.append_record(id, succeeded(2, "reserveInventory", serde_json::json!({})))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for id in ids {
        let instance = log.require_instance(id).await.unwrap();
        assert_eq!(instance.records.len(), 2);
    }
}

#[tokio::test]
async fn header_update_and_cancellation() {
    let log = get_test_log().await;
    let mut header = new_header();
    let id = header.instance_id;
    log.create_instance(header.clone()).await.unwrap();

    assert!(log.request_cancellation(id).await.unwrap());

    header.step_index = 2;
    header.status = WorkflowStatus::Compensating;
    header.compensation_attempted = true;
    log.update_header(&header).await.unwrap();

    let stored = log.get_header(id).await.unwrap().unwrap();
    assert_eq!(stored.step_index, 2);
    assert_eq!(stored.status, WorkflowStatus::Compensating);
    assert!(stored.cancel_requested, "stale header must not clear the mark");

    header.status = WorkflowStatus::Failed;
    header.remediation = vec!["reserveInventory".to_string()];
    log.update_header(&header).await.unwrap();

    assert!(!log.request_cancellation(id).await.unwrap());
    let stored = log.get_header(id).await.unwrap().unwrap();
    assert_eq!(stored.remediation, vec!["reserveInventory".to_string()]);
}

#[tokio::test]
async fn unfinished_instances_and_purge() {
    let log = get_test_log().await;
    let running = new_header();
    let mut done = new_header();
    log.create_instance(running.clone()).await.unwrap();
    log.create_instance(done.clone()).await.unwrap();

    done.status = WorkflowStatus::Done;
    log.update_header(&done).await.unwrap();

    let unfinished = log.unfinished_instances().await.unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].instance_id, running.instance_id);

    let by_definition = log
        .list_instances(InstanceQuery::new().definition_id("createShipmentWorkflow"))
        .await
        .unwrap();
    assert_eq!(by_definition.len(), 2);

    let result = log.purge_instance(running.instance_id).await;
    assert!(matches!(result, Err(TransactionLogError::NotTerminal { .. })));

    log.purge_instance(done.instance_id).await.unwrap();
    assert!(!log.instance_exists(done.instance_id).await.unwrap());
}
