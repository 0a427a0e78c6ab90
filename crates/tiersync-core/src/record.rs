//! Row-level change records observed on the origin's change log.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Column name → value mapping, in declared column order.
pub type Row = IndexMap<String, serde_json::Value>;

/// Type of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown change operation '{other}'")),
        }
    }
}

/// One row mutation inside a raw stream event.
///
/// UPDATE rows carry their before and after images as one explicit pair, so
/// a batch with several updates can never mix images of different rows.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert { after: Row },
    Update { before: Row, after: Row },
    Delete { before: Row },
}

impl RowChange {
    pub fn operation(&self) -> ChangeOperation {
        match self {
            Self::Insert { .. } => ChangeOperation::Insert,
            Self::Update { .. } => ChangeOperation::Update,
            Self::Delete { .. } => ChangeOperation::Delete,
        }
    }
}

/// A decoded change-log event for one table, possibly carrying several rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub schema: String,
    pub table: String,
    /// Declared primary-key columns of the table, in key order.
    pub primary_key: Vec<String>,
    pub rows: Vec<RowChange>,
    pub tx_id: Option<String>,
    pub position: Option<String>,
    /// Row images were cut down to the primary-key columns.
    pub keys_only: bool,
}

impl RowsEvent {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            primary_key: Vec::new(),
            rows: Vec::new(),
            tx_id: None,
            position: None,
            keys_only: false,
        }
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_row(mut self, change: RowChange) -> Self {
        self.rows.push(change);
        self
    }

    pub fn with_tx_id(mut self, tx_id: impl Into<String>) -> Self {
        self.tx_id = Some(tx_id.into());
        self
    }

    #[must_use]
    pub fn with_keys_only(mut self, keys_only: bool) -> Self {
        self.keys_only = keys_only;
        self
    }

    /// `schema.table`, the key used by table filters.
    pub fn table_key(&self) -> String {
        table_key(&self.schema, &self.table)
    }
}

pub fn table_key(schema: &str, table: &str) -> String {
    format!("{schema}.{table}")
}

/// Canonical representation of one row mutation.
///
/// INSERT carries only `after`, DELETE only `before`, UPDATE both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub schema: String,
    pub table: String,
    pub operation: ChangeOperation,
    pub primary_key: Row,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    /// `before`/`after` hold only the primary-key columns.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keys_only: bool,
}

impl ChangeRecord {
    /// Build the record for one row of `event`.
    ///
    /// Primary-key values come from the image that describes the row after the
    /// mutation (the before-image for DELETE). Declared key columns missing
    /// from that image are left out.
    pub fn from_row(event: &RowsEvent, change: RowChange) -> Self {
        let operation = change.operation();
        let (before, after) = match change {
            RowChange::Insert { after } => (None, Some(after)),
            RowChange::Update { before, after } => (Some(before), Some(after)),
            RowChange::Delete { before } => (Some(before), None),
        };

        let key_source = after.as_ref().or(before.as_ref());
        let primary_key = key_source
            .map(|row| extract_columns(row, &event.primary_key))
            .unwrap_or_default();

        Self {
            timestamp: OffsetDateTime::now_utc(),
            schema: event.schema.clone(),
            table: event.table.clone(),
            operation,
            primary_key,
            before,
            after,
            tx_id: event.tx_id.clone(),
            position: event.position.clone(),
            keys_only: event.keys_only,
        }
    }
}

/// Pick `columns` out of `row`, preserving the order of `columns`.
pub(crate) fn extract_columns(row: &Row, columns: &[String]) -> Row {
    columns
        .iter()
        .filter_map(|col| row.get(col).map(|v| (col.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
pub(crate) fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product_event() -> RowsEvent {
        RowsEvent::new("public", "web_product").with_primary_key(["id"])
    }

    #[test]
    fn test_operation_parse_is_case_insensitive() {
        assert_eq!("insert".parse::<ChangeOperation>(), Ok(ChangeOperation::Insert));
        assert_eq!("Update".parse::<ChangeOperation>(), Ok(ChangeOperation::Update));
        assert_eq!("DELETE".parse::<ChangeOperation>(), Ok(ChangeOperation::Delete));
        assert!("TRUNCATE".parse::<ChangeOperation>().is_err());
    }

    #[test]
    fn test_insert_record_has_after_image_only() {
        let event = product_event();
        let after = row(&[("id", json!(101)), ("name", json!("lamp"))]);
        let record = ChangeRecord::from_row(&event, RowChange::Insert { after: after.clone() });

        assert_eq!(record.operation, ChangeOperation::Insert);
        assert_eq!(record.after, Some(after));
        assert!(record.before.is_none());
        assert_eq!(record.primary_key, row(&[("id", json!(101))]));
    }

    #[test]
    fn test_delete_record_has_before_image_only() {
        let event = product_event();
        let before = row(&[("id", json!(7)), ("name", json!("chair"))]);
        let record = ChangeRecord::from_row(&event, RowChange::Delete { before: before.clone() });

        assert_eq!(record.operation, ChangeOperation::Delete);
        assert_eq!(record.before, Some(before));
        assert!(record.after.is_none());
        assert_eq!(record.primary_key, row(&[("id", json!(7))]));
    }

    #[test]
    fn test_update_record_keeps_pair() {
        let event = product_event();
        let before = row(&[("id", json!(1)), ("extra", json!("old"))]);
        let after = row(&[("id", json!(1)), ("extra", json!("new"))]);
        let record = ChangeRecord::from_row(
            &event,
            RowChange::Update {
                before: before.clone(),
                after: after.clone(),
            },
        );

        assert_eq!(record.before, Some(before));
        assert_eq!(record.after, Some(after));
    }

    #[test]
    fn test_keys_only_update_still_yields_primary_key() {
        let event = product_event().with_keys_only(true);
        let record = ChangeRecord::from_row(
            &event,
            RowChange::Update {
                before: row(&[("id", json!(5))]),
                after: row(&[("id", json!(5))]),
            },
        );

        assert!(record.keys_only);
        assert_eq!(record.primary_key, row(&[("id", json!(5))]));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["keys_only"], true);
    }

    #[test]
    fn test_composite_primary_key_follows_declared_order() {
        let event = RowsEvent::new("public", "order_line").with_primary_key(["order_id", "line"]);
        let after = row(&[("line", json!(2)), ("sku", json!("x")), ("order_id", json!(9))]);
        let record = ChangeRecord::from_row(&event, RowChange::Insert { after });

        let keys: Vec<&String> = record.primary_key.keys().collect();
        assert_eq!(keys, vec!["order_id", "line"]);
    }

    #[test]
    fn test_record_serializes_operation_uppercase() {
        let event = product_event();
        let record = ChangeRecord::from_row(
            &event,
            RowChange::Insert {
                after: row(&[("id", json!(1))]),
            },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["operation"], "INSERT");
        assert!(json.get("before").is_none());
        assert!(json.get("keys_only").is_none());
    }
}
