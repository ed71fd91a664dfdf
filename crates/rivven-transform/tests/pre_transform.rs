//! End-to-end pre-transform behavior
//!
//! Drives the engine with schema announcements and row changes the way a CDC
//! source would and checks what leaves it.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rivven_transform::event::{
    ControlEvent, CreateTableEvent, DataChangeEvent, Event, OperationType, RowImage,
};
use rivven_transform::rule::TransformRuleConfig;
use rivven_transform::schema::{Column, DataType, Schema};
use rivven_transform::table_id::TableId;
use rivven_transform::{PreTransformEngine, TransformConfig, TransformError};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

fn large_orders_rule() -> TransformRuleConfig {
    TransformRuleConfig::new("db.orders")
        .with_projection("id, amount")
        .with_filter("amount > 100")
}

#[test]
fn test_orders_scenario() {
    let engine = engine(vec![large_orders_rule()]);

    let reduced = announced_schema(
        engine
            .process(create_table("db.orders", orders_schema()))
            .unwrap(),
    );
    assert_eq!(reduced.column_names(), vec!["id", "amount"]);
    assert_eq!(reduced.primary_keys(), ["id".to_string()]);

    let out = engine
        .process(insert(
            "db.orders",
            vec![json!(5), json!(150), json!("x"), json!("2024-03-01 10:00:00.000")],
        ))
        .unwrap();
    assert_eq!(after_values(out), vec![json!(5), json!(150)]);
}

#[test]
fn test_unmatched_table_is_unchanged() {
    let engine = engine(vec![large_orders_rule()]);

    let reduced = announced_schema(engine.process(create_table("db.logs", logs_schema())).unwrap());
    assert_eq!(reduced, logs_schema());

    let event = insert("db.logs", vec![json!(1), json!("{\"level\":\"info\"}")]);
    assert_eq!(engine.process(event.clone()).unwrap(), event);
}

#[test]
fn test_wildcard_keeps_source_order_regardless_of_filter() {
    let engine = engine(vec![TransformRuleConfig::new("db.orders")
        .with_projection("*, UPPER(customer) AS customer_upper")
        .with_filter("customer IS NOT NULL AND ts > TO_TIMESTAMP('2024-01-01')")]);

    let reduced = announced_schema(
        engine
            .process(create_table("db.orders", orders_schema()))
            .unwrap(),
    );
    assert_eq!(reduced, orders_schema());
}

#[test]
fn test_union_with_filter_and_primary_key() {
    let engine = engine(vec![
        TransformRuleConfig::new("db.orders").with_projection("ts"),
        TransformRuleConfig::new("db.order*")
            .with_projection("CONCAT(customer, '#') AS tag")
            .with_filter("ts IS NOT NULL"),
    ]);

    let reduced = announced_schema(
        engine
            .process(create_table("db.orders", orders_schema()))
            .unwrap(),
    );
    // projection-string order is ignored; source order and the key survive
    assert_eq!(reduced.column_names(), vec!["id", "customer", "ts"]);

    let out = engine
        .process(insert(
            "db.orders",
            vec![json!(1), json!(10), json!("acme"), json!("2024-01-01")],
        ))
        .unwrap();
    assert_eq!(after_values(out), vec![json!(1), json!("acme"), json!("2024-01-01")]);
}

#[test]
fn test_metadata_overrides() {
    let engine = engine(vec![
        TransformRuleConfig::new("db.orders")
            .with_projection("amount")
            .with_primary_keys("id, customer")
            .with_partition_keys("ts")
            .with_table_options("bucket=8,changelog-mode=upsert"),
    ]);

    let reduced = announced_schema(
        engine
            .process(create_table("db.orders", orders_schema()))
            .unwrap(),
    );
    assert_eq!(reduced.column_names(), vec!["id", "amount", "customer"]);
    assert_eq!(
        reduced.primary_keys(),
        ["id".to_string(), "customer".to_string()]
    );
    assert_eq!(reduced.partition_keys(), ["ts".to_string()]);
    assert_eq!(reduced.options()["bucket"], "8");
    assert_eq!(reduced.options()["changelog-mode"], "upsert");
}

#[test]
fn test_schema_replacement_discards_old_columns() {
    let engine = engine(vec![
        TransformRuleConfig::new("db.orders").with_projection("id, customer")
    ]);
    engine
        .process(create_table("db.orders", orders_schema()))
        .unwrap();

    // customer moved to the front, amount and ts dropped
    let v2 = Schema::builder()
        .column(Column::new("customer", DataType::Varchar(64)))
        .column(Column::new("id", DataType::BigInt).with_nullable(false))
        .column(Column::new("note", DataType::String))
        .primary_key(["id"])
        .build()
        .unwrap();
    let reduced =
        announced_schema(engine.process(create_table("db.orders", v2)).unwrap());
    assert_eq!(reduced.column_names(), vec!["customer", "id"]);

    let out = engine
        .process(insert("db.orders", vec![json!("acme"), json!(3), json!("n")]))
        .unwrap();
    assert_eq!(after_values(out), vec![json!("acme"), json!(3)]);

    let cached = engine.cache().get(&table("db.orders")).unwrap();
    assert_eq!(cached.source_schema().column_names(), vec!["customer", "id", "note"]);
}

#[test]
fn test_data_before_schema_is_fatal() {
    let engine = engine(vec![large_orders_rule()]);
    let err = engine
        .process(insert("db.orders", vec![json!(1), json!(1), json!("x"), json!(null)]))
        .unwrap_err();

    assert!(matches!(
        err.root_cause(),
        TransformError::MissingSchema { table_id } if table_id.to_string() == "db.orders"
    ));
    assert!(err.to_string().contains("without a full schema view"));
}

#[test]
fn test_unmatched_table_still_needs_schema() {
    let engine = engine(vec![large_orders_rule()]);
    let err = engine
        .process(insert("db.logs", vec![json!(1), json!("p")]))
        .unwrap_err();
    assert!(err.is_missing_schema());
}

#[test]
fn test_change_kinds_and_null_halves() {
    let engine = engine(vec![large_orders_rule()]);
    engine
        .process(create_table("db.orders", orders_schema()))
        .unwrap();

    let row = |amount: i64| RowImage::new(vec![json!(9), json!(amount), json!("c"), json!(null)]);
    let events: Vec<Event> = vec![
        DataChangeEvent::update(table("db.orders"), None, row(200)).into(),
        DataChangeEvent::delete(table("db.orders"), row(200)).into(),
        DataChangeEvent::replace(table("db.orders"), row(300)).into(),
    ];
    let out = engine.process_batch(events).unwrap();

    let projected: Vec<(OperationType, Option<RowImage>, Option<RowImage>)> = out
        .into_iter()
        .map(|e| match e {
            Event::DataChange(e) => (e.op, e.before, e.after),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        projected,
        vec![
            (
                OperationType::Update,
                None,
                Some(RowImage::new(vec![json!(9), json!(200)]))
            ),
            (
                OperationType::Delete,
                Some(RowImage::new(vec![json!(9), json!(200)])),
                None
            ),
            (
                OperationType::Replace,
                None,
                Some(RowImage::new(vec![json!(9), json!(300)]))
            ),
        ]
    );
}

#[test]
fn test_control_events_untouched() {
    let engine = engine(vec![large_orders_rule()]);
    let flush: Event = ControlEvent::new("flush", json!({"checkpoint": 42}))
        .for_table(table("db.orders"))
        .into();
    assert_eq!(engine.process(flush.clone()).unwrap(), flush);
}

#[test]
fn test_config_from_yaml() {
    let config = TransformConfig::from_yaml_str(
        r#"
transforms:
  - source-table: db.orders
    projection: id, amount
    filter: amount > 100
    description: keep large orders
  - source-table: db.audit_*
    projection: "*"
"#,
    )
    .unwrap();
    let engine = PreTransformEngine::new(config).unwrap();
    assert_eq!(engine.rules().len(), 2);

    let reduced = announced_schema(
        engine
            .process(create_table("db.orders", orders_schema()))
            .unwrap(),
    );
    assert_eq!(reduced.column_names(), vec!["id", "amount"]);
}

#[test]
fn test_checkpoint_survives_engine_restart() {
    let first = engine(vec![large_orders_rule()]);
    first
        .process(create_table("db.orders", orders_schema()))
        .unwrap();
    first.process(create_table("db.logs", logs_schema())).unwrap();
    let snapshot = serde_json::to_string(&first.checkpoint()).unwrap();
    first.shutdown();

    let second = engine(vec![large_orders_rule()]);
    second
        .restore(&serde_json::from_str(&snapshot).unwrap())
        .unwrap();
    let out = second
        .process(insert(
            "db.orders",
            vec![json!(8), json!(101), json!("z"), json!(null)],
        ))
        .unwrap();
    assert_eq!(after_values(out), vec![json!(8), json!(101)]);
}

#[test]
fn test_checkpoint_keeps_dotted_table_names() {
    let dotted = TableId::with_schema("db", "v1.orders");
    let rules = || vec![TransformRuleConfig::new(r"db.v1\.orders").with_projection("id, amount")];

    let first = engine(rules());
    first
        .process(CreateTableEvent::new(dotted.clone(), orders_schema()).into())
        .unwrap();
    let snapshot = serde_json::to_string(&first.checkpoint()).unwrap();

    let second = engine(rules());
    second
        .restore(&serde_json::from_str(&snapshot).unwrap())
        .unwrap();
    assert_eq!(second.cache().table_ids(), vec![dotted.clone()]);

    let out = second
        .process(
            DataChangeEvent::insert(
                dotted,
                RowImage::new(vec![json!(4), json!(12), json!("y"), json!(null)]),
            )
            .into(),
        )
        .unwrap();
    assert_eq!(after_values(out), vec![json!(4), json!(12)]);
}

#[test]
fn test_checkpoint_reads_while_processing() {
    let engine = Arc::new(engine(vec![large_orders_rule()]));
    engine
        .process(create_table("db.orders", orders_schema()))
        .unwrap();

    let reader = {
        let cache = engine.cache();
        std::thread::spawn(move || {
            for _ in 0..200 {
                let snapshot = cache.snapshot();
                for table in &snapshot.tables {
                    // every entry is internally consistent
                    for column in table.reduced_schema.columns() {
                        assert!(table.source_schema.column(&column.name).is_some());
                    }
                }
            }
        })
    };

    for i in 0..200 {
        let schema = if i % 2 == 0 {
            orders_schema()
        } else {
            orders_schema()
                .to_builder()
                .column(Column::new("extra", DataType::Int))
                .build()
                .unwrap()
        };
        engine.process(create_table("db.orders", schema)).unwrap();
    }
    reader.join().unwrap();
}

#[tokio::test]
async fn test_async_driver_preserves_order() {
    let engine = Arc::new(engine(vec![large_orders_rule()]));
    let (in_tx, in_rx) = mpsc::channel(4);
    let (out_tx, mut out_rx) = mpsc::channel(4);

    let task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(in_rx, out_tx).await })
    };

    let producer = tokio::spawn(async move {
        in_tx
            .send(create_table("db.orders", orders_schema()))
            .await
            .unwrap();
        for id in 0..20 {
            in_tx
                .send(insert(
                    "db.orders",
                    vec![json!(id), json!(id * 10), json!("c"), json!(null)],
                ))
                .await
                .unwrap();
        }
    });

    let first = out_rx.recv().await.unwrap();
    assert_eq!(announced_schema(first).column_names(), vec!["id", "amount"]);
    for id in 0..20 {
        let event = out_rx.recv().await.unwrap();
        assert_eq!(after_values(event), vec![json!(id), json!(id * 10)]);
    }

    producer.await.unwrap();
    assert_eq!(task.await.unwrap().unwrap(), 21);
    assert_eq!(engine.stats().data_events, 20);
}
