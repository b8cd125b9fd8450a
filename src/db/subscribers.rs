//! Postgres-backed subscriber feed.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::WorkItem;
use crate::source::{Page, RecordSource};

/// Keyset pagination over `subscribers` in id order.
#[async_trait]
impl RecordSource for super::Db {
    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page> {
        let limit = limit.max(1);
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT id, data FROM subscribers
             WHERE $1::text IS NULL OR id > $1
             ORDER BY id
             LIMIT $2",
        )
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let full = rows.len() == limit;
        let items = rows
            .into_iter()
            .map(|(id, mut data)| {
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("id".to_string(), serde_json::Value::String(id));
                }
                WorkItem::from_json(data)
            })
            .collect::<Result<Vec<_>>>()?;

        let next_cursor = if full {
            items.last().map(|item| item.id().to_string())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }
}

impl super::Db {
    /// Insert or replace raw subscribers. Used by loaders and tests.
    pub async fn upsert_subscribers(&self, items: &[WorkItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = items.iter().map(|i| i.id().to_string()).collect();
        let payloads: Vec<serde_json::Value> = items
            .iter()
            .map(|i| serde_json::Value::Object(i.fields().clone()))
            .collect();
        sqlx::query(
            "INSERT INTO subscribers (id, data)
             SELECT * FROM UNNEST($1::text[], $2::jsonb[])
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(&ids)
        .bind(&payloads)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
