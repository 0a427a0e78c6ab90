//! Cache key derivation from table + primary key.

use std::collections::HashMap;

use indexmap::IndexSet;

use crate::record::{ChangeOperation, ChangeRecord, Row, table_key};

/// Separator between key prefix and primary-key parts.
pub const KEY_SEPARATOR: &str = ":";

/// Build a cache key: `prefix:part1[:part2...]`.
pub fn cache_key<I, S>(prefix: &str, parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = prefix.to_string();
    for part in parts {
        key.push_str(KEY_SEPARATOR);
        key.push_str(part.as_ref());
    }
    key
}

/// Render one primary-key value as a key part.
///
/// Strings are used as-is so `"abc"` and `abc` produce the same key; every
/// other value uses its JSON text.
pub fn key_part(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// How to derive cache keys for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRule {
    pub prefix: String,
    /// Key columns in order. Empty means "use the record's primary key".
    pub columns: Vec<String>,
}

/// Per-table key rules, keyed by `schema.table`. Tables without a rule are
/// not cached.
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    rules: HashMap<String, KeyRule>,
}

impl KeySpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `schema.table` under `prefix`, keyed by the record's primary key.
    pub fn with_table(self, schema: &str, table: &str, prefix: impl Into<String>) -> Self {
        self.with_rule(schema, table, prefix, Vec::<String>::new())
    }

    pub fn with_rule<I, S>(
        mut self,
        schema: &str,
        table: &str,
        prefix: impl Into<String>,
        columns: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.insert(
            table_key(schema, table),
            KeyRule {
                prefix: prefix.into(),
                columns: columns.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn is_monitored(&self, schema: &str, table: &str) -> bool {
        self.rules.contains_key(&table_key(schema, table))
    }

    pub fn rule(&self, schema: &str, table: &str) -> Option<&KeyRule> {
        self.rules.get(&table_key(schema, table))
    }

    /// Cache keys affected by `record`.
    ///
    /// Returns an empty list when the table has no rule or the key columns
    /// are missing. An UPDATE that changed the primary key yields both the
    /// old and the new key.
    pub fn keys_for(&self, record: &ChangeRecord) -> Vec<String> {
        let Some(rule) = self.rule(&record.schema, &record.table) else {
            return Vec::new();
        };

        let columns: Vec<String> = if rule.columns.is_empty() {
            record.primary_key.keys().cloned().collect()
        } else {
            rule.columns.clone()
        };
        if columns.is_empty() {
            return Vec::new();
        }

        let mut keys = IndexSet::new();
        if let Some(key) = rule.key_from(&record.primary_key, &columns) {
            keys.insert(key);
        }
        if record.operation == ChangeOperation::Update
            && let Some(before) = &record.before
            && let Some(key) = rule.key_from(before, &columns)
        {
            keys.insert(key);
        }
        keys.into_iter().collect()
    }
}

impl KeyRule {
    fn key_from(&self, row: &Row, columns: &[String]) -> Option<String> {
        let parts = columns
            .iter()
            .map(|col| row.get(col).map(key_part))
            .collect::<Option<Vec<_>>>()?;
        Some(cache_key(&self.prefix, parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RowChange, RowsEvent, row};
    use serde_json::json;

    fn space() -> KeySpace {
        KeySpace::new().with_rule("public", "web_product", "web_product", ["id"])
    }

    fn update(before_id: i64, after_id: i64) -> ChangeRecord {
        let event = RowsEvent::new("public", "web_product").with_primary_key(["id"]);
        ChangeRecord::from_row(
            &event,
            RowChange::Update {
                before: row(&[("id", json!(before_id)), ("extra", json!("a"))]),
                after: row(&[("id", json!(after_id)), ("extra", json!("b"))]),
            },
        )
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key("web_product", ["101"]), "web_product:101");
        assert_eq!(cache_key("line", ["9", "2"]), "line:9:2");
    }

    #[test]
    fn test_key_part_strips_string_quotes() {
        assert_eq!(key_part(&json!("abc")), "abc");
        assert_eq!(key_part(&json!(42)), "42");
        assert_eq!(key_part(&json!(true)), "true");
    }

    #[test]
    fn test_keys_for_update_same_pk() {
        assert_eq!(space().keys_for(&update(101, 101)), vec!["web_product:101"]);
    }

    #[test]
    fn test_keys_for_update_changed_pk_evicts_both() {
        assert_eq!(
            space().keys_for(&update(1, 2)),
            vec!["web_product:2", "web_product:1"]
        );
    }

    #[test]
    fn test_keys_for_unmonitored_table_is_empty() {
        let event = RowsEvent::new("public", "audit").with_primary_key(["id"]);
        let record = ChangeRecord::from_row(
            &event,
            RowChange::Insert {
                after: row(&[("id", json!(1))]),
            },
        );
        assert!(space().keys_for(&record).is_empty());
        assert!(!space().is_monitored("public", "audit"));
    }

    #[test]
    fn test_keys_for_missing_pk_column_is_empty() {
        let event = RowsEvent::new("public", "web_product");
        let record = ChangeRecord::from_row(
            &event,
            RowChange::Insert {
                after: row(&[("name", json!("x"))]),
            },
        );
        assert!(space().keys_for(&record).is_empty());
    }

    #[test]
    fn test_rule_without_columns_uses_record_primary_key() {
        let space = KeySpace::new().with_table("public", "order_line", "ol");
        let event = RowsEvent::new("public", "order_line").with_primary_key(["order_id", "line"]);
        let record = ChangeRecord::from_row(
            &event,
            RowChange::Delete {
                before: row(&[("order_id", json!("A7")), ("line", json!(3))]),
            },
        );
        assert_eq!(space.keys_for(&record), vec!["ol:A7:3"]);
    }

    #[test]
    fn test_same_table_name_in_other_schema_is_not_cached() {
        let event = RowsEvent::new("archive", "web_product").with_primary_key(["id"]);
        let record = ChangeRecord::from_row(
            &event,
            RowChange::Update {
                before: row(&[("id", json!(101))]),
                after: row(&[("id", json!(101))]),
            },
        );
        assert!(space().keys_for(&record).is_empty());
        assert!(!space().is_monitored("archive", "web_product"));
        assert!(space().is_monitored("public", "web_product"));
    }
}
