use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

/// One decoded line of the history log.
///
/// The payload is kept as the full JSON object (including `id`) so a record
/// re-encodes to the same fields it was read from.  Only `id` has meaning to
/// the sync engine; an empty id means the record is never deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: String,
    fields: Map<String, Value>,
}

impl Record {
    /// Build a record from an id and payload fields.  A non-empty `id` is
    /// written into the payload, replacing any `id` field already there.
    pub fn new(id: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        let id = id.into();
        if id.is_empty() {
            fields.remove("id");
        } else {
            fields.insert("id".to_string(), Value::String(id.clone()));
        }
        Self { id, fields }
    }

    /// Build a record with a freshly generated UUID v4 id.
    pub fn with_fresh_id(fields: Map<String, Value>) -> Self {
        Self::new(Uuid::new_v4().to_string(), fields)
    }

    pub(crate) fn from_parts(id: String, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Decode the payload into a caller-defined message type.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}
