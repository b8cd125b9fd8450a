//! Enrichment stage definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::WorkItem;
use crate::pool::ScalingConfig;

/// Per-item enrichment for one stage. Returns the record with this stage's
/// fields added; an error drops the item from this stage only.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, item: WorkItem) -> Result<WorkItem>;
}

/// Admission predicate for an optional stage.
pub type Gate = Arc<dyn Fn(&WorkItem) -> bool + Send + Sync>;

/// One stage: a named enricher, its worker pool shape and an optional gate.
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub enricher: Arc<dyn Enricher>,
    pub gate: Option<Gate>,
    pub scaling: ScalingConfig,
    /// Per-item deadline. An item that runs over is forwarded unenriched.
    pub item_timeout: Option<Duration>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, enricher: Arc<dyn Enricher>) -> Self {
        Self {
            name: name.into(),
            enricher,
            gate: None,
            scaling: ScalingConfig::default(),
            item_timeout: None,
        }
    }

    pub fn with_gate<F>(mut self, gate: F) -> Self
    where
        F: Fn(&WorkItem) -> bool + Send + Sync + 'static,
    {
        self.gate = Some(Arc::new(gate));
        self
    }

    pub fn with_scaling(mut self, scaling: ScalingConfig) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    /// Whether `item` should be routed to this stage.
    pub fn admits(&self, item: &WorkItem) -> bool {
        self.gate.as_ref().is_none_or(|gate| gate(item))
    }
}

/// Canonicalizes `email_address` and derives `email_domain` from it.
///
/// Records without an address pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailNormalizer;

#[async_trait]
impl Enricher for EmailNormalizer {
    async fn enrich(&self, mut item: WorkItem) -> Result<WorkItem> {
        let Some(raw) = item.get_str("email_address") else {
            return Ok(item);
        };
        let email = raw.trim().to_lowercase();
        let domain = match email.rsplit_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => domain.to_string(),
            _ => return Err(Error::Other(format!("malformed email address: {email:?}"))),
        };
        item.set("email_address", email);
        item.set("email_domain", domain);
        Ok(item)
    }
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("gated", &self.gate.is_some())
            .field("scaling", &self.scaling)
            .field("item_timeout", &self.item_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Enricher for Noop {
        async fn enrich(&self, item: WorkItem) -> Result<WorkItem> {
            Ok(item)
        }
    }

    #[test]
    fn ungated_stage_admits_everything() {
        let stage = StageSpec::new("location", Arc::new(Noop));
        assert!(stage.admits(&WorkItem::new("s1")));
    }

    #[test]
    fn gate_filters_items() {
        let stage = StageSpec::new("lookup", Arc::new(Noop))
            .with_gate(|item| item.get_str("email_type") == Some("personal"));
        assert!(stage.admits(&WorkItem::new("s1").with_field("email_type", "personal")));
        assert!(!stage.admits(&WorkItem::new("s2").with_field("email_type", "work")));
        assert!(!stage.admits(&WorkItem::new("s3")));
    }

    #[tokio::test]
    async fn normalizer_lowercases_and_splits_domain() {
        let item = WorkItem::new("s1").with_field("email_address", "  Jane.Doe@Example.COM ");
        let out = EmailNormalizer.enrich(item).await.unwrap();
        assert_eq!(out.get_str("email_address"), Some("jane.doe@example.com"));
        assert_eq!(out.get_str("email_domain"), Some("example.com"));
    }

    #[tokio::test]
    async fn normalizer_passes_records_without_email() {
        let item = WorkItem::new("s1").with_field("name", "Jane");
        let out = EmailNormalizer.enrich(item.clone()).await.unwrap();
        assert_eq!(out, item);
    }

    #[tokio::test]
    async fn normalizer_rejects_address_without_domain() {
        let item = WorkItem::new("s1").with_field("email_address", "jane@");
        assert!(EmailNormalizer.enrich(item).await.is_err());
    }
}
