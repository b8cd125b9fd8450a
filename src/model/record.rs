//! The record type carried between stages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A subscriber record with a typed identity and an open set of fields.
///
/// Stages may add or overwrite fields but can never drop the `id`: it lives
/// outside the property bag and `set("id", ..)` is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    id: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Build a record from a raw JSON object as returned by a source.
    ///
    /// Numeric ids are accepted and stored in their decimal string form.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::Other("record is not a JSON object".to_string()));
        };
        let id = match fields.remove("id") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => return Err(Error::Other(format!("unusable record id: {other}"))),
            None => return Err(Error::Other("record has no id".to_string())),
        };
        Ok(Self { id, fields })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Convenience accessor for string-valued fields.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Set a field, returning the previous value. Writes to `id` are ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if key == "id" {
            tracing::warn!(record = %self.id, "refusing to overwrite record id");
            return None;
        }
        self.fields.insert(key, value.into())
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Shallow merge: every field of `other` overwrites the same field here.
    /// Used when several stages enriched disjoint parts of one record.
    pub fn merge_from(&mut self, other: &WorkItem) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    /// The full record as a JSON object, `id` included.
    pub fn to_json(&self) -> Value {
        let mut obj = self.fields.clone();
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(obj)
    }
}
