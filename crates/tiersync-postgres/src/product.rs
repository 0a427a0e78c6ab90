//! `web_product` origin store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx_core::query_as::query_as;
use tiersync_core::{OriginError, OriginStore};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use crate::PgPool;
use crate::error::{PostgresError, Result};

/// Table name, also used as the cache key prefix.
pub const PRODUCT_TABLE: &str = "web_product";

/// Schema the table is created in.
pub const PRODUCT_SCHEMA: &str = "public";

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS web_product (
        id          BIGINT PRIMARY KEY,
        code        VARCHAR(64) NOT NULL,
        name        VARCHAR(255) NOT NULL,
        mode        INTEGER NOT NULL DEFAULT 0,
        extra       TEXT NOT NULL DEFAULT '',
        version     BIGINT NOT NULL DEFAULT 1,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        deleted_at  TIMESTAMPTZ
    )
"#;

const SELECT_SQL: &str = r#"
    SELECT id, code, name, mode, extra, version, created_at, updated_at, deleted_at
    FROM web_product WHERE id = $1
"#;

const UPSERT_SQL: &str = r#"
    INSERT INTO web_product (id, code, name, mode, extra, version, created_at, updated_at, deleted_at)
    VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, now()), now(), $8)
    ON CONFLICT (id) DO UPDATE SET
        code = EXCLUDED.code,
        name = EXCLUDED.name,
        mode = EXCLUDED.mode,
        extra = EXCLUDED.extra,
        version = EXCLUDED.version,
        updated_at = now(),
        deleted_at = EXCLUDED.deleted_at
"#;

type ProductRow = (
    i64,
    String,
    String,
    i32,
    String,
    i64,
    OffsetDateTime,
    OffsetDateTime,
    Option<OffsetDateTime>,
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub mode: i32,
    pub extra: String,
    pub version: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Product {
    /// A fresh product; timestamps are assigned by the store.
    pub fn new(id: i64, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            name: name.into(),
            mode: 1,
            extra: String::new(),
            version: 1,
            created_at: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        let (id, code, name, mode, extra, version, created_at, updated_at, deleted_at) = row;
        Self {
            id,
            code,
            name,
            mode,
            extra,
            version,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
            deleted_at,
        }
    }
}

/// PostgreSQL-backed store for [`Product`].
#[derive(Clone)]
pub struct ProductStore {
    pool: PgPool,
}

impl ProductStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `web_product` table if it does not exist.
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx_core::query::query(CREATE_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(PostgresError::from)?;
        info!(table = PRODUCT_TABLE, "Origin table ready");
        Ok(())
    }

    async fn select(&self, id: i64) -> Result<Option<Product>> {
        let row: Option<ProductRow> = query_as(SELECT_SQL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PostgresError::from)?;
        Ok(row.map(Product::from))
    }

    async fn upsert(&self, product: &Product) -> Result<()> {
        sqlx_core::query::query(UPSERT_SQL)
            .bind(product.id)
            .bind(&product.code)
            .bind(&product.name)
            .bind(product.mode)
            .bind(&product.extra)
            .bind(product.version)
            .bind(product.created_at)
            .bind(product.deleted_at)
            .execute(&self.pool)
            .await
            .map_err(PostgresError::from)?;
        debug!(id = product.id, "Product stored");
        Ok(())
    }
}

#[async_trait]
impl OriginStore for ProductStore {
    type Id = i64;
    type Record = Product;

    fn table(&self) -> &str {
        PRODUCT_TABLE
    }

    async fn fetch(&self, id: &i64) -> std::result::Result<Option<Product>, OriginError> {
        Ok(self.select(*id).await?)
    }

    async fn store(&self, record: &Product) -> std::result::Result<(), OriginError> {
        Ok(self.upsert(record).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_product_json_shape() {
        let mut product = Product::new(10001, "TEST_PRODUCT_001", "Test").with_extra("{}");
        product.created_at = Some(datetime!(2024-05-01 10:00:00 UTC));

        let json = serde_json::to_value(&product).unwrap();
        assert_eq!(json["id"], 10001);
        assert_eq!(json["created_at"], "2024-05-01T10:00:00Z");
        assert!(json["deleted_at"].is_null());

        let back: Product = serde_json::from_value(json).unwrap();
        assert_eq!(back, product);
    }

    #[test]
    fn test_from_row() {
        let now = datetime!(2024-05-01 10:00:00 UTC);
        let product = Product::from((1, "c".into(), "n".into(), 2, "e".into(), 3, now, now, None));
        assert_eq!(product.version, 3);
        assert_eq!(product.updated_at, Some(now));
    }
}
