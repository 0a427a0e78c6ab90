//! Row-level change trigger that feeds the change stream.

use tracing::{info, instrument};

use crate::PgPool;
use crate::error::{PostgresError, Result};

/// Name of the trigger function.
pub const NOTIFY_FUNCTION: &str = "tiersync_notify_change";

/// Trigger arguments: `(channel, pk_column...)`. One `NOTIFY` per row
/// mutation; row images come from `row_to_json`, so column order matches the
/// table definition.
///
/// `pg_notify` rejects payloads over 7999 bytes, and the error would abort the
/// origin write. When the full images do not fit they are cut down to
/// the primary-key columns and the payload is flagged `keys_only`. If even
/// that does not fit, the change is reported with a `WARNING` and not
/// notified; the shared tier's TTL then bounds staleness.
const NOTIFY_FUNCTION_SQL: &str = r#"
    CREATE OR REPLACE FUNCTION tiersync_notify_change()
    RETURNS TRIGGER AS $$
    DECLARE
        key_columns text[] := TG_ARGV[1:TG_NARGS - 1];
        before_row json;
        after_row json;
        keys_only boolean := false;
        payload text;
    BEGIN
        IF TG_OP IN ('UPDATE', 'DELETE') THEN
            before_row := row_to_json(OLD);
        END IF;
        IF TG_OP IN ('INSERT', 'UPDATE') THEN
            after_row := row_to_json(NEW);
        END IF;

        LOOP
            payload := json_build_object(
                'schema', TG_TABLE_SCHEMA,
                'table', TG_TABLE_NAME,
                'op', TG_OP,
                'tx_id', txid_current()::text,
                'primary_key', to_json(key_columns),
                'keys_only', keys_only,
                'rows', json_build_array(
                    json_build_object('before', before_row, 'after', after_row)
                )
            )::text;

            EXIT WHEN octet_length(payload) <= 7999;

            IF keys_only THEN
                RAISE WARNING 'tiersync: change on %.% too large to notify, skipped',
                    TG_TABLE_SCHEMA, TG_TABLE_NAME;
                RETURN NULL;
            END IF;

            SELECT json_object_agg(key, value) INTO before_row
                FROM json_each(before_row) WHERE key = ANY(key_columns);
            SELECT json_object_agg(key, value) INTO after_row
                FROM json_each(after_row) WHERE key = ANY(key_columns);
            keys_only := true;
        END LOOP;

        PERFORM pg_notify(TG_ARGV[0], payload);
        RETURN NULL;
    END;
    $$ LANGUAGE plpgsql;
"#;

/// Create or replace the trigger function.
#[instrument(skip(pool))]
pub async fn install_notify_function(pool: &PgPool) -> Result<()> {
    sqlx_core::query::query(NOTIFY_FUNCTION_SQL)
        .execute(pool)
        .await
        .map_err(PostgresError::from)?;
    Ok(())
}

/// (Re)create the change trigger on `schema.table`.
///
/// Identifiers are interpolated into DDL and must be plain
/// `[A-Za-z_][A-Za-z0-9_]*` names.
#[instrument(skip(pool))]
pub async fn install_change_trigger(
    pool: &PgPool,
    schema: &str,
    table: &str,
    primary_key: &[&str],
    channel: &str,
) -> Result<()> {
    for name in [schema, table, channel].iter().chain(primary_key) {
        validate_identifier(name)?;
    }
    if primary_key.is_empty() {
        return Err(PostgresError::config(format!(
            "table {schema}.{table} needs at least one primary key column"
        )));
    }

    let trigger = trigger_name(table);
    let drop_sql = format!(r#"DROP TRIGGER IF EXISTS "{trigger}" ON "{schema}"."{table}""#);
    sqlx_core::query::query(&drop_sql)
        .execute(pool)
        .await
        .map_err(PostgresError::from)?;

    sqlx_core::query::query(&create_trigger_sql(schema, table, primary_key, channel))
        .execute(pool)
        .await
        .map_err(PostgresError::from)?;

    info!(schema, table, channel, "Installed change trigger");
    Ok(())
}

fn trigger_name(table: &str) -> String {
    format!("{table}_tiersync_change")
}

fn create_trigger_sql(schema: &str, table: &str, primary_key: &[&str], channel: &str) -> String {
    let args = std::iter::once(channel)
        .chain(primary_key.iter().copied())
        .map(|arg| format!("'{arg}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"CREATE TRIGGER "{trigger}"
            AFTER INSERT OR UPDATE OR DELETE ON "{schema}"."{table}"
            FOR EACH ROW EXECUTE FUNCTION {NOTIFY_FUNCTION}({args})"#,
        trigger = trigger_name(table),
    )
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PostgresError::config(format!("invalid identifier: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_trigger_sql() {
        let sql = create_trigger_sql("public", "order_line", &["order_id", "line_no"], "changes");
        assert!(sql.contains(r#"CREATE TRIGGER "order_line_tiersync_change""#));
        assert!(sql.contains(r#"ON "public"."order_line""#));
        assert!(sql.contains("tiersync_notify_change('changes', 'order_id', 'line_no')"));
    }

    #[test]
    fn test_notify_function_falls_back_to_keys_only() {
        assert!(NOTIFY_FUNCTION_SQL.contains("octet_length(payload) <= 7999"));
        assert!(NOTIFY_FUNCTION_SQL.contains("WHERE key = ANY(key_columns)"));
        assert!(NOTIFY_FUNCTION_SQL.contains("'keys_only', keys_only"));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("web_product").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("a'; DROP TABLE x; --").is_err());
    }
}
