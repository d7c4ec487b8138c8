//! Items and their system of record.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;

/// A named record identified by the system of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
}

/// Ground-truth storage for items.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Insert a new item and return its generated ID.
    async fn insert(&self, name: &str) -> StoreResult<String>;

    async fn find(&self, id: &str) -> StoreResult<Option<Item>>;

    /// Rename the item; `false` if no item has that ID.
    async fn update(&self, item: &Item) -> StoreResult<bool>;
}

/// [`ItemRepository`] over the SQLite `items` table.
#[derive(Clone)]
pub struct SqliteItemRepository {
    db: Database,
}

impl SqliteItemRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Item IDs are SQLite row IDs rendered as decimal strings.
fn row_id(id: &str) -> Option<i64> {
    id.parse().ok()
}

#[async_trait]
impl ItemRepository for SqliteItemRepository {
    #[instrument(skip(self))]
    async fn insert(&self, name: &str) -> StoreResult<String> {
        let name = name.to_owned();
        let id = self
            .db
            .execute(move |conn| {
                let now = Utc::now().timestamp();
                conn.execute(
                    "INSERT INTO items (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
                    params![name, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        debug!(id, "item inserted");
        Ok(id.to_string())
    }

    #[instrument(skip(self))]
    async fn find(&self, id: &str) -> StoreResult<Option<Item>> {
        let Some(row) = row_id(id) else {
            return Ok(None);
        };
        self.db
            .execute(move |conn| {
                let item = conn
                    .query_row("SELECT id, name FROM items WHERE id = ?1", params![row], |r| {
                        Ok(Item {
                            id: r.get::<_, i64>(0)?.to_string(),
                            name: r.get(1)?,
                        })
                    })
                    .optional()?;
                Ok(item)
            })
            .await
    }

    #[instrument(skip(self), fields(id = %item.id))]
    async fn update(&self, item: &Item) -> StoreResult<bool> {
        let Some(row) = row_id(&item.id) else {
            return Ok(false);
        };
        let name = item.name.clone();
        let changed = self
            .db
            .execute(move |conn| {
                let now = Utc::now().timestamp();
                Ok(conn.execute(
                    "UPDATE items SET name = ?2, updated_at = ?3 WHERE id = ?1",
                    params![row, name, now],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }
}
