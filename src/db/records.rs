//! Postgres-backed enriched record persistence.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::model::WorkItem;
use crate::sink::RecordSink;
use crate::telemetry::metrics;

#[async_trait]
impl RecordSink for super::Db {
    async fn upsert_batch(&self, items: &[WorkItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let started = Instant::now();

        // One row per id: stage copies of the same record are folded first,
        // since ON CONFLICT cannot touch a row twice in one statement.
        let mut order: Vec<&str> = Vec::new();
        let mut folded: HashMap<&str, WorkItem> = HashMap::new();
        for item in items {
            folded
                .entry(item.id())
                .and_modify(|existing| existing.merge_from(item))
                .or_insert_with(|| {
                    order.push(item.id());
                    item.clone()
                });
        }

        let mut ids = Vec::with_capacity(order.len());
        let mut payloads = Vec::with_capacity(order.len());
        for id in order {
            let item = folded
                .remove(id)
                .ok_or_else(|| Error::Other(format!("record {id} lost while folding batch")))?;
            ids.push(id.to_string());
            payloads.push(serde_json::Value::Object(item.fields().clone()));
        }

        sqlx::query(
            "INSERT INTO enriched_records (id, data)
             SELECT * FROM UNNEST($1::text[], $2::jsonb[])
             ON CONFLICT (id) DO UPDATE
             SET data = enriched_records.data || EXCLUDED.data, updated_at = now()",
        )
        .bind(&ids)
        .bind(&payloads)
        .execute(&self.pool)
        .await?;

        metrics::records_written().add(ids.len() as u64, &[KeyValue::new("sink", "postgres")]);
        metrics::batch_write_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("sink", "postgres")],
        );
        Ok(())
    }
}

impl super::Db {
    /// Fetch one enriched record by id.
    pub async fn get_enriched_record(&self, id: &str) -> Result<Option<WorkItem>> {
        let row: Option<(String, serde_json::Value)> =
            sqlx::query_as("SELECT id, data FROM enriched_records WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(id, mut data)| {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("id".to_string(), serde_json::Value::String(id));
            }
            WorkItem::from_json(data)
        })
        .transpose()
    }

    pub async fn count_enriched_records(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM enriched_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
