//! Parsing of `wal2json` format version 2 messages.
//!
//! Every message describes one change, or the begin or commit of its transaction:
//!
//! ```json
//! {"action":"U","timestamp":"2024-01-02 03:04:05.1+00","schema":"public","table":"t_order",
//!  "columns":[{"name":"order_id","type":"bigint","value":"1"}],
//!  "identity":[{"name":"order_id","type":"bigint","value":"1"}],
//!  "pk":[{"name":"order_id","type":"bigint"}]}
//! ```

use serde::Deserialize;

use crate::dialect::ChangeEvent;
use crate::dialect::postgres::decode::{parse_timestamptz, value_from_json};
use crate::error::{ErrorKind, MigrationResult};
use crate::migration_error;
use crate::position::{IncrementalPosition, Lsn};
use crate::types::{Column, ColumnType, DataRecord, TableName};

/// Output plugin used for change capture slots.
pub(super) const PLUGIN: &str = "wal2json";

#[derive(Debug, Deserialize)]
struct Message {
    action: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Vec<MessageColumn>,
    #[serde(default)]
    identity: Vec<MessageColumn>,
    #[serde(default)]
    pk: Vec<KeyColumn>,
}

#[derive(Debug, Deserialize)]
struct MessageColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct KeyColumn {
    name: String,
}

/// Value of the `add-tables` option selecting the tables of a feed.
pub(super) fn add_tables_option(tables: &[TableName]) -> String {
    tables
        .iter()
        .map(|table| {
            let schema = table.schema.as_deref().unwrap_or("public");
            format!("{}.{}", escape(schema), escape(&table.name))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Escapes the separators of the `add-tables` option.
fn escape(name: &str) -> String {
    name.chars()
        .flat_map(|c| match c {
            ',' | '.' | '\\' | '*' => vec!['\\', c],
            c => vec![c],
        })
        .collect()
}

/// Changes of one committed transaction, in the order they were made.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Transaction {
    /// End of the commit record, as reported by the plugin for the commit message.
    pub commit: Lsn,
    pub events: Vec<ChangeEvent>,
}

/// Groups peeked `(lsn, data)` rows into committed transactions.
///
/// Changes of a transaction are positioned by its commit and their index inside it. A trailing
/// transaction without its commit message is dropped.
pub(super) fn parse_transactions<I, S>(rows: I) -> MigrationResult<Vec<Transaction>>
where
    I: IntoIterator<Item = (S, S)>,
    S: AsRef<str>,
{
    let mut transactions = Vec::new();
    let mut pending: Vec<(DataRecord, Option<String>)> = Vec::new();

    for (lsn, data) in rows {
        let (lsn, data) = (lsn.as_ref(), data.as_ref());
        let message: Message = serde_json::from_str(data)?;

        match message.action.as_str() {
            "B" => pending.clear(),
            "C" => {
                let commit = lsn.parse::<Lsn>()?;
                let commit_time = message.timestamp.as_deref().and_then(parse_timestamptz);
                let events = pending
                    .drain(..)
                    .enumerate()
                    .map(|(index, (record, timestamp))| ChangeEvent {
                        position: IncrementalPosition::Lsn {
                            commit,
                            index: index as u32,
                        },
                        committed_at: commit_time
                            .or_else(|| timestamp.as_deref().and_then(parse_timestamptz)),
                        record,
                    })
                    .collect();
                transactions.push(Transaction { commit, events });
            }
            "M" => {}
            _ => {
                let record = parse_record(lsn, &message)?;
                pending.push((record, message.timestamp));
            }
        }
    }

    Ok(transactions)
}

fn parse_record(lsn: &str, message: &Message) -> MigrationResult<DataRecord> {
    let table = || -> MigrationResult<TableName> {
        let name = message.table.clone().ok_or_else(|| {
            migration_error!(
                ErrorKind::ProtocolError,
                "Change message has no table",
                format!("action {} at {lsn}", message.action)
            )
        })?;
        Ok(TableName::new(message.schema.clone(), name))
    };
    let keys: Vec<&str> = message.pk.iter().map(|key| key.name.as_str()).collect();

    let record = match message.action.as_str() {
        "I" => DataRecord::insert(table()?, columns(&message.columns, &keys)?),
        "U" => {
            let after = columns(&message.columns, &keys)?;
            // Without a changed key or replica identity full, the identity repeats the key.
            let before = if message.identity.is_empty() {
                after.iter().filter(|column| column.key).cloned().collect()
            } else {
                columns(&message.identity, &keys)?
            };
            DataRecord::update(table()?, before, after)
        }
        "D" => DataRecord::delete(table()?, columns(&message.identity, &keys)?),
        action => {
            return Err(migration_error!(
                ErrorKind::ProtocolError,
                "Unknown change action",
                format!("action {action} at {lsn}")
            ));
        }
    };

    Ok(record)
}

fn columns(columns: &[MessageColumn], keys: &[&str]) -> MigrationResult<Vec<Column>> {
    columns
        .iter()
        .map(|column| {
            let data_type = ColumnType::from_sql_name(&base_type_name(&column.type_name));
            Ok(Column {
                name: column.name.clone(),
                value: value_from_json(data_type, &column.value)?,
                key: keys.contains(&column.name.as_str()),
            })
        })
        .collect()
}

/// Drops type modifiers: `numeric(10,2)` becomes `numeric` and
/// `timestamp(3) without time zone` becomes `timestamp without time zone`.
fn base_type_name(type_name: &str) -> String {
    let mut base = String::with_capacity(type_name.len());
    let mut depth = 0usize;
    for c in type_name.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if depth == 0 => base.push(c),
            _ => {}
        }
    }

    base.trim().to_string()
}
