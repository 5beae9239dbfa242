use criterion::{Criterion, criterion_group, criterion_main};
use transaction_log::{
    InMemoryTransactionLog, InstanceHeader, InstanceId, RecordPhase, Sequence,
    StepExecutionRecord, TransactionLog,
};

fn new_header() -> InstanceHeader {
    InstanceHeader::new(
        InstanceId::new(),
        "createShipmentWorkflow",
        serde_json::json!({"fulfillment_id": "ful_bench"}),
    )
}

fn bench_append_step_pair(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("transaction_log/append_step_pair", |b| {
        b.iter(|| {
            rt.block_on(async {
                let log = InMemoryTransactionLog::new();
                let header = new_header();
                let id = header.instance_id;
                log.create_instance(header).await.unwrap();
                log.append_record(
                    id,
                    StepExecutionRecord::pending(Sequence::first(), RecordPhase::Invoke, "s", "s:k"),
                )
                .await
                .unwrap();
                log.append_record(
                    id,
                    StepExecutionRecord::succeeded(
                        Sequence::new(2),
                        "s",
                        "s:k",
                        serde_json::json!({"ok": true}),
                        1,
                    ),
                )
                .await
                .unwrap();
            });
        });
    });
}

fn bench_load_instance_100_records(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let log = InMemoryTransactionLog::new();
    let header = new_header();
    let id = header.instance_id;

    rt.block_on(async {
        log.create_instance(header).await.unwrap();
        for i in 0..50 {
            let seq = Sequence::new(i * 2 + 1);
            let key = format!("step{i}:k");
            log.append_record(
                id,
                StepExecutionRecord::pending(seq, RecordPhase::Invoke, format!("step{i}"), &key),
            )
            .await
            .unwrap();
            log.append_record(
                id,
                StepExecutionRecord::succeeded(
                    seq.next(),
                    format!("step{i}"),
                    &key,
                    serde_json::json!({"i": i}),
                    1,
                ),
            )
            .await
            .unwrap();
        }
    });

    c.bench_function("transaction_log/load_instance_100_records", |b| {
        b.iter(|| {
            rt.block_on(async {
                log.load_instance(id).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_step_pair,
    bench_load_instance_100_records
);
criterion_main!(benches);
