//! Paginated record sources.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::WorkItem;

/// One page of records from a [`RecordSource`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<WorkItem>,
    /// Cursor for the next page, `None` when the source is exhausted.
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn last_id(&self) -> Option<&str> {
        self.items.last().map(WorkItem::id)
    }
}

/// Upstream record feed with keyset pagination.
///
/// A cursor is the id of the last record already consumed: `fetch_page`
/// returns records strictly after it, and `None` starts from the beginning.
/// Retrying transient upstream errors is the implementor's job.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page>;
}

/// A fixed, ordered set of records served page by page.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    items: Vec<WorkItem>,
}

impl MemorySource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page> {
        let start = match cursor {
            None => 0,
            Some(after) => self
                .items
                .iter()
                .position(|item| item.id() == after)
                .map(|i| i + 1)
                .unwrap_or(self.items.len()),
        };
        let end = (start + limit.max(1)).min(self.items.len());
        let items = self.items[start..end].to_vec();
        let next_cursor = if end < self.items.len() {
            items.last().map(|item| item.id().to_string())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(n: usize) -> MemorySource {
        MemorySource::new((1..=n).map(|i| WorkItem::new(format!("s{i}"))).collect())
    }

    #[tokio::test]
    async fn pages_until_exhausted() {
        let source = source(5);
        let first = source.fetch_page(None, 2).await.unwrap();
        assert_eq!(first.last_id(), Some("s2"));
        assert_eq!(first.next_cursor.as_deref(), Some("s2"));

        let last = source.fetch_page(Some("s4"), 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn unknown_cursor_yields_empty_page() {
        let page = source(3).fetch_page(Some("nope"), 10).await.unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_cursor.is_none());
    }
}
