//! Decoding of change-trigger `NOTIFY` payloads.
//!
//! ```text
//! {"schema":"public","table":"web_product","op":"UPDATE","tx_id":"812",
//!  "primary_key":["id"],"rows":[{"before":{...},"after":{...}}]}
//! ```
//!
//! Each element of `rows` is one logical row mutation carrying its own
//! before/after pair, so UPDATE images are never paired by position. Rows too
//! large for one notification arrive with `"keys_only":true` and images that
//! hold only the primary-key columns.

use std::str::FromStr;

use serde::Deserialize;
use tiersync_core::{ChangeOperation, Row, RowChange, RowsEvent, StreamError};

#[derive(Debug, Deserialize)]
struct NotifyPayload {
    schema: String,
    table: String,
    op: String,
    #[serde(default)]
    tx_id: Option<String>,
    #[serde(default)]
    primary_key: Vec<String>,
    #[serde(default)]
    keys_only: bool,
    rows: Vec<PayloadRow>,
}

#[derive(Debug, Deserialize)]
struct PayloadRow {
    #[serde(default)]
    before: Option<Row>,
    #[serde(default)]
    after: Option<Row>,
}

/// Decode one payload into a raw rows event.
///
/// Images that do not match the operation (an UPDATE without a before-image,
/// an INSERT with one) make the whole event undecodable.
pub fn decode_payload(payload: &str) -> Result<RowsEvent, StreamError> {
    let parsed: NotifyPayload = serde_json::from_str(payload)
        .map_err(|e| StreamError::Decode(format!("invalid change payload: {e}")))?;

    let operation = ChangeOperation::from_str(&parsed.op).map_err(StreamError::Decode)?;
    if parsed.rows.is_empty() {
        return Err(StreamError::Decode(format!(
            "{} event on {}.{} carries no rows",
            operation, parsed.schema, parsed.table
        )));
    }

    let mut event = RowsEvent::new(parsed.schema, parsed.table)
        .with_primary_key(parsed.primary_key)
        .with_keys_only(parsed.keys_only);
    if let Some(tx_id) = parsed.tx_id {
        event = event.with_tx_id(tx_id);
    }

    for (index, row) in parsed.rows.into_iter().enumerate() {
        let change = match (operation, row.before, row.after) {
            (ChangeOperation::Insert, None, Some(after)) => RowChange::Insert { after },
            (ChangeOperation::Update, Some(before), Some(after)) => {
                RowChange::Update { before, after }
            }
            (ChangeOperation::Delete, Some(before), None) => RowChange::Delete { before },
            (operation, before, after) => {
                return Err(StreamError::Decode(format!(
                    "row {index} of {operation} event has before={} after={}",
                    before.is_some(),
                    after.is_some()
                )));
            }
        };
        event = event.with_row(change);
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_insert() {
        let event = decode_payload(
            r#"{"schema":"public","table":"web_product","op":"INSERT","tx_id":"42",
                "primary_key":["id"],"rows":[{"before":null,"after":{"id":101,"extra":"x"}}]}"#,
        )
        .unwrap();

        assert_eq!(event.table_key(), "public.web_product");
        assert_eq!(event.tx_id.as_deref(), Some("42"));
        assert_eq!(event.primary_key, vec!["id"]);
        assert!(!event.keys_only);
        let RowChange::Insert { after } = &event.rows[0] else {
            panic!("expected insert");
        };
        assert_eq!(after["id"], 101);
    }

    #[test]
    fn test_decode_update_keeps_pairs() {
        let event = decode_payload(
            r#"{"schema":"public","table":"t","op":"update","primary_key":["id"],"rows":[
                {"before":{"id":1,"v":"a"},"after":{"id":1,"v":"b"}},
                {"before":{"id":2,"v":"c"},"after":{"id":2,"v":"d"}}]}"#,
        )
        .unwrap();

        assert_eq!(event.rows.len(), 2);
        let RowChange::Update { before, after } = &event.rows[1] else {
            panic!("expected update");
        };
        assert_eq!(before["v"], "c");
        assert_eq!(after["v"], "d");
    }

    #[test]
    fn test_decode_keys_only_update() {
        let event = decode_payload(
            r#"{"schema":"public","table":"web_product","op":"UPDATE","primary_key":["id"],
                "keys_only":true,"rows":[{"before":{"id":10001},"after":{"id":10001}}]}"#,
        )
        .unwrap();

        assert!(event.keys_only);
        let record = tiersync_core::ChangeRecord::from_row(&event, event.rows[0].clone());
        assert!(record.keys_only);
        assert_eq!(record.primary_key["id"], 10001);
    }

    #[test]
    fn test_decode_preserves_column_order() {
        let event = decode_payload(
            r#"{"schema":"public","table":"t","op":"DELETE","primary_key":["id"],
                "rows":[{"before":{"zeta":1,"id":2,"alpha":3}}]}"#,
        )
        .unwrap();
        let RowChange::Delete { before } = &event.rows[0] else {
            panic!("expected delete");
        };
        let columns: Vec<&str> = before.keys().map(String::as_str).collect();
        assert_eq!(columns, vec!["zeta", "id", "alpha"]);
    }

    #[test]
    fn test_mismatched_images_are_decode_errors() {
        let err = decode_payload(
            r#"{"schema":"public","table":"t","op":"UPDATE","rows":[{"before":null,"after":{"id":1}}]}"#,
        )
        .unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn test_unknown_operation_and_garbage() {
        assert!(
            decode_payload(r#"{"schema":"s","table":"t","op":"TRUNCATE","rows":[{}]}"#)
                .unwrap_err()
                .is_decode()
        );
        assert!(decode_payload("not json").unwrap_err().is_decode());
        assert!(
            decode_payload(r#"{"schema":"s","table":"t","op":"INSERT","rows":[]}"#)
                .unwrap_err()
                .is_decode()
        );
    }
}
