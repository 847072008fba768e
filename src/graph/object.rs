//! Graph objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::reference::Reference;

/// A node in the graph.
///
/// Objects are immutable per valid-time version: re-asserting an object with
/// different attributes stores a new version, never an in-place edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Natural-key identity.
    pub primary_key: Reference,

    /// Object type, equal to the reference prefix.
    pub object_type: String,

    /// Non-key attribute values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Object {
    /// Creates an object from its type and natural-key parts.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if the reference cannot be built.
    pub fn new<S: AsRef<str>>(object_type: &str, natural_key: &[S]) -> Result<Self, ValidationError> {
        let primary_key = Reference::new(object_type, natural_key)?;
        Ok(Self {
            primary_key,
            object_type: object_type.to_string(),
            attributes: BTreeMap::new(),
        })
    }

    /// Adds or replaces an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn reference(&self) -> &Reference {
        &self.primary_key
    }

    /// Stable hash of the attribute content (hex encoded blake3).
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.primary_key.as_str().as_bytes());
        hasher.update(&[0]);
        // BTreeMap iteration order is sorted, so the encoding is canonical.
        if let Ok(bytes) = serde_json::to_vec(&self.attributes) {
            hasher.update(&bytes);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Object as it appears in an ingestion payload.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInput {
    pub object_type: String,
    pub natural_key: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<ObjectInput> for Object {
    type Error = ValidationError;

    fn try_from(input: ObjectInput) -> Result<Self, Self::Error> {
        let mut object = Self::new(&input.object_type, input.natural_key.as_slice())?;
        object.attributes = input.attributes;
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_new() {
        let obj = Object::new("Hostname", &["internet", "example.com"]).unwrap();
        assert_eq!(obj.reference().as_str(), "Hostname|internet|example.com");
        assert_eq!(obj.object_type, "Hostname");
        assert!(obj.attributes.is_empty());
    }

    #[test]
    fn test_content_hash_tracks_attributes() {
        let a = Object::new("IPPort", &["internet", "1.1.1.1", "tcp", "80"]).unwrap();
        let b = a.clone().with_attribute("state", serde_json::json!("open"));
        let c = a.clone().with_attribute("state", serde_json::json!("open"));

        assert_ne!(a.content_hash(), b.content_hash());
        assert_eq!(b.content_hash(), c.content_hash());
    }

    #[test]
    fn test_input_conversion() {
        let input: ObjectInput = serde_json::from_value(serde_json::json!({
            "object_type": "IPAddressV4",
            "natural_key": ["internet", "1.1.1.1"],
            "attributes": {"scan_source": "nmap"}
        }))
        .unwrap();
        let obj = Object::try_from(input).unwrap();
        assert_eq!(obj.reference().as_str(), "IPAddressV4|internet|1.1.1.1");
        assert_eq!(obj.attributes["scan_source"], "nmap");
    }

    #[test]
    fn test_input_conversion_rejects_bad_type() {
        let input = ObjectInput {
            object_type: "ip".to_string(),
            natural_key: vec!["x".to_string()],
            attributes: BTreeMap::new(),
        };
        assert!(Object::try_from(input).is_err());
    }
}
