//! PostgreSQL collaborators for tiersync.
//!
//! - [`PgChangeSource`]: change-log stream over `LISTEN/NOTIFY`, fed by the
//!   row-level trigger installed with [`install_change_trigger`]
//! - [`ProductStore`]: the `web_product` origin store
//!
//! ```ignore
//! let pool = create_pool(&config).await?;
//! install_notify_function(&pool).await?;
//! install_change_trigger(&pool, "public", "web_product", &["id"], &config.channel).await?;
//!
//! let source = PgChangeSource::new(pool.clone(), &config.channel);
//! ```

mod config;
mod error;
mod payload;
mod pool;
mod product;
mod source;
mod trigger;

pub use config::PostgresConfig;
pub use error::{PostgresError, Result};
pub use payload::decode_payload;
pub use pool::create_pool;
pub use product::{PRODUCT_SCHEMA, PRODUCT_TABLE, Product, ProductStore};
pub use source::PgChangeSource;
pub use trigger::{NOTIFY_FUNCTION, install_change_trigger, install_notify_function};

/// Re-export of the PostgreSQL pool type.
pub type PgPool = sqlx_postgres::PgPool;
