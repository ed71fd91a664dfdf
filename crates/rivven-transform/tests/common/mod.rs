//! Shared fixtures for pre-transform integration tests
#![allow(dead_code)]

use rivven_transform::event::{CreateTableEvent, DataChangeEvent, Event, RowImage};
use rivven_transform::rule::{TransformConfig, TransformRuleConfig};
use rivven_transform::schema::{Column, DataType, Schema};
use rivven_transform::table_id::TableId;
use rivven_transform::PreTransformEngine;
use serde_json::Value;

pub fn table(id: &str) -> TableId {
    TableId::parse(id).unwrap()
}

/// `db.orders` as captured: (id, amount, customer, ts), keyed by id
pub fn orders_schema() -> Schema {
    Schema::builder()
        .column(Column::new("id", DataType::BigInt).with_nullable(false))
        .column(Column::new("amount", DataType::Decimal { precision: 10, scale: 2 }))
        .column(Column::new("customer", DataType::Varchar(64)))
        .column(Column::new("ts", DataType::Timestamp(3)))
        .primary_key(["id"])
        .build()
        .unwrap()
}

/// `db.logs`: (id, payload), no primary key
pub fn logs_schema() -> Schema {
    Schema::builder()
        .column(Column::new("id", DataType::BigInt))
        .column(Column::new("payload", DataType::String))
        .build()
        .unwrap()
}

pub fn engine(rules: Vec<TransformRuleConfig>) -> PreTransformEngine {
    PreTransformEngine::new(TransformConfig::builder().transforms(rules).build().unwrap()).unwrap()
}

pub fn create_table(id: &str, schema: Schema) -> Event {
    CreateTableEvent::new(table(id), schema).into()
}

pub fn insert(id: &str, values: Vec<Value>) -> Event {
    DataChangeEvent::insert(table(id), RowImage::new(values)).into()
}

/// Schema carried by a re-emitted announcement.
pub fn announced_schema(event: Event) -> Schema {
    match event {
        Event::CreateTable(e) => e.schema,
        other => panic!("expected create table event, got {:?}", other),
    }
}

/// After image of a re-emitted data change.
pub fn after_values(event: Event) -> Vec<Value> {
    match event {
        Event::DataChange(e) => e.after.expect("after image").into_values(),
        other => panic!("expected data change event, got {:?}", other),
    }
}
