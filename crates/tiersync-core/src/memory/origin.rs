use std::collections::BTreeMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::MemoryFeed;
use crate::orchestrator::{OriginError, OriginStore};
use crate::record::{Row, RowChange, RowsEvent};

/// Map-backed origin store keyed by an integer primary key.
///
/// Every mutation is also pushed into a [`MemoryFeed`] as a raw change event,
/// the way a database trigger would, so caches only learn about writes
/// through the change stream.
pub struct MemoryOrigin<R> {
    schema: String,
    table: String,
    primary_key: String,
    rows: Mutex<BTreeMap<i64, Row>>,
    feed: MemoryFeed,
    _record: PhantomData<fn() -> R>,
}

impl<R> MemoryOrigin<R>
where
    R: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        primary_key: impl Into<String>,
        feed: MemoryFeed,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            primary_key: primary_key.into(),
            rows: Mutex::new(BTreeMap::new()),
            feed,
            _record: PhantomData,
        }
    }

    /// Remove the record with `id`. Returns whether it existed.
    pub fn delete(&self, id: i64) -> bool {
        let Some(before) = self.rows.lock().remove(&id) else {
            return false;
        };
        self.emit(RowChange::Delete { before });
        true
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    fn to_row(&self, record: &R) -> Result<(i64, Row), OriginError> {
        let row: Row = serde_json::to_value(record)
            .and_then(serde_json::from_value)
            .map_err(|e| OriginError::InvalidRecord(e.to_string()))?;
        let id = row
            .get(&self.primary_key)
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                OriginError::InvalidRecord(format!(
                    "missing integer primary key column '{}'",
                    self.primary_key
                ))
            })?;
        Ok((id, row))
    }

    fn emit(&self, change: RowChange) {
        let event = RowsEvent::new(&self.schema, &self.table)
            .with_primary_key([self.primary_key.as_str()])
            .with_row(change);
        if !self.feed.push(event) {
            debug!(table = %self.table, "No change stream attached, event discarded");
        }
    }
}

#[async_trait]
impl<R> OriginStore for MemoryOrigin<R>
where
    R: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Id = i64;
    type Record = R;

    fn table(&self) -> &str {
        &self.table
    }

    async fn fetch(&self, id: &i64) -> Result<Option<R>, OriginError> {
        let Some(row) = self.rows.lock().get(id).cloned() else {
            return Ok(None);
        };
        let value = serde_json::to_value(row).map_err(|e| OriginError::Query(e.to_string()))?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| OriginError::InvalidRecord(e.to_string()))
    }

    async fn store(&self, record: &R) -> Result<(), OriginError> {
        let (id, after) = self.to_row(record)?;
        let before = self.rows.lock().insert(id, after.clone());
        let change = match before {
            Some(before) => RowChange::Update { before, after },
            None => RowChange::Insert { after },
        };
        self.emit(change);
        Ok(())
    }
}
