// Document handles and the shapes documents take on the way out of the store

use crate::error::Result;
use crate::model::SubmodelInstance;
use crate::path::DocPath;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Field map of a document.
pub type Fields = serde_json::Map<String, Value>;

/// Opaque reference to a single document in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentRef {
    path: DocPath,
}

impl DocumentRef {
    /// Wrap a document path. `path` must address a document.
    pub fn new(path: DocPath) -> Self {
        debug_assert!(path.is_document(), "{path} is not a document path");
        DocumentRef { path }
    }

    pub fn parse(path: &str) -> Result<Self> {
        Ok(DocumentRef::new(DocPath::parse_document(path)?))
    }

    pub fn id(&self) -> &str {
        self.path.last().unwrap_or_default()
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    /// Path of the collection holding this document.
    pub fn collection_path(&self) -> DocPath {
        self.path.parent().unwrap_or_default()
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.fmt(f)
    }
}

/// A document as the store returns it: every stored field, no schema applied.
/// `fields` is `None` when the document does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub reference: DocumentRef,
    pub fields: Option<Fields>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl RawDocument {
    pub fn missing(reference: DocumentRef) -> Self {
        RawDocument {
            reference,
            fields: None,
            create_time: None,
            update_time: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.fields.is_some()
    }
}

/// A document restricted to its collection's declared properties, with a
/// handle for every subcollection registered under the collection.
#[derive(Clone)]
pub struct SanitizedDocument {
    pub id: String,
    pub reference: DocumentRef,
    pub fields: Fields,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub children: BTreeMap<String, SubmodelInstance>,
}

impl SanitizedDocument {
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.fields.get(property)
    }

    /// Subcollection handle bound to this document.
    pub fn child(&self, name: &str) -> Option<&SubmodelInstance> {
        self.children.get(name)
    }

    pub fn path(&self) -> &DocPath {
        self.reference.path()
    }

    /// Deserialize the fields into a typed value.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

impl fmt::Debug for SanitizedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SanitizedDocument")
            .field("id", &self.id)
            .field("path", &self.reference.path().to_string())
            .field("fields", &self.fields)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_ref() {
        let reference = DocumentRef::parse("profiles/abc/groups/g1").unwrap();
        assert_eq!(reference.id(), "g1");
        assert_eq!(reference.collection_path().to_string(), "profiles/abc/groups");
        assert_eq!(reference.to_string(), "profiles/abc/groups/g1");
        assert!(DocumentRef::parse("profiles").is_err());
    }

    #[test]
    fn test_missing_document() {
        let raw = RawDocument::missing(DocumentRef::parse("profiles/a").unwrap());
        assert!(!raw.exists());
    }
}
