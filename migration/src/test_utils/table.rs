use std::ops::RangeInclusive;

use crate::dialect::memory::MemoryDatabase;
use crate::types::{ColumnSchema, ColumnType, TableName, TableSchema, Value};

pub fn t_order() -> TableName {
    TableName::new(None, "t_order".to_string())
}

/// `t_order(order_id bigint primary key, user_id integer, status text)`.
pub fn t_order_schema() -> TableSchema {
    TableSchema::new(
        t_order(),
        vec![
            ColumnSchema::new("order_id", ColumnType::Int8, false, true),
            ColumnSchema::new("user_id", ColumnType::Int4, true, false),
            ColumnSchema::new("status", ColumnType::Text, true, false),
        ],
    )
}

/// A `t_order` row. Users are assigned round-robin over ten ids.
pub fn t_order_row(order_id: i64, status: &str) -> Vec<Value> {
    vec![
        Value::I64(order_id),
        Value::I32((order_id % 10) as i32),
        Value::from(status),
    ]
}

/// Creates `t_order` in `database` when missing and inserts one `new` order per id.
pub async fn seed_t_order(database: &MemoryDatabase, order_ids: RangeInclusive<i64>) {
    database.create_table(t_order_schema()).await;
    database
        .insert_rows(
            &t_order(),
            order_ids.map(|order_id| t_order_row(order_id, "new")).collect(),
        )
        .await
        .expect("failed to seed t_order");
}

/// Statuses of every `t_order` row, in key order.
pub async fn t_order_statuses(database: &MemoryDatabase) -> Vec<(i64, String)> {
    database
        .rows(&t_order())
        .await
        .into_iter()
        .filter_map(|row| {
            let order_id = row.key_at(0)?;
            let status = row.values.get(2)?.to_string();
            Some((order_id, status))
        })
        .collect()
}
