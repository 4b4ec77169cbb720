use crate::document::Fields;
use crate::schema::SchemaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level schema definition parsed from a schema YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionDefinition>,
}

/// Definition of a single collection and the subcollections nested under
/// each of its documents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionDefinition {
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub defaults: Fields,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionDefinition>,
}

/// Programmatic declaration of a collection schema.
///
/// A declaration with a `parent` describes a subcollection that exists under
/// every document of the parent collection.
#[derive(Debug, Clone, Default)]
pub struct ModelDeclaration {
    pub name: String,
    pub properties: Vec<String>,
    pub defaults: Fields,
    pub parent: Option<SchemaId>,
}

impl ModelDeclaration {
    pub fn new<I, S>(name: &str, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ModelDeclaration {
            name: name.to_string(),
            properties: properties.into_iter().map(Into::into).collect(),
            defaults: Fields::new(),
            parent: None,
        }
    }

    pub fn with_default(mut self, property: &str, value: serde_json::Value) -> Self {
        self.defaults.insert(property.to_string(), value);
        self
    }

    /// Declare this collection as a subcollection of `parent`.
    pub fn under(mut self, parent: SchemaId) -> Self {
        self.parent = Some(parent);
        self
    }
}
