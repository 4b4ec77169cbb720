use super::types::{CollectionDefinition, ModelDeclaration, SchemaDefinition};
use crate::document::Fields;
use crate::error::{DocModelError, Result};
use crate::path::validate_id;
use crate::sanitizer::Sanitizer;
use std::collections::BTreeMap;
use std::ops::Index;

/// Stable handle to a collection schema inside a [`SchemaRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(usize);

/// One declared collection schema.
#[derive(Debug, Clone)]
pub struct SchemaNode {
    name: String,
    parent: Option<SchemaId>,
    children: BTreeMap<String, SchemaId>,
    sanitizer: Sanitizer,
}

impl SchemaNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<SchemaId> {
        self.parent
    }

    /// Child collection schemas keyed by collection name.
    pub fn children(&self) -> &BTreeMap<String, SchemaId> {
        &self.children
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    pub fn defaults(&self) -> &Fields {
        self.sanitizer.defaults()
    }
}

/// Arena of collection schemas. Parents reference children by ID, children
/// reference their parent by ID, so the graph carries no ownership cycles.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    nodes: Vec<SchemaNode>,
    roots: BTreeMap<String, SchemaId>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// Build a registry from a parsed schema file, declaring parents before
    /// their subcollections.
    pub fn from_definition(definition: &SchemaDefinition) -> Result<Self> {
        let mut registry = SchemaRegistry::new();
        for (name, collection) in &definition.collections {
            registry.declare_tree(name, collection, None)?;
        }
        Ok(registry)
    }

    fn declare_tree(
        &mut self,
        name: &str,
        collection: &CollectionDefinition,
        parent: Option<SchemaId>,
    ) -> Result<SchemaId> {
        let id = self.declare(ModelDeclaration {
            name: name.to_string(),
            properties: collection.properties.clone(),
            defaults: collection.defaults.clone(),
            parent,
        })?;
        for (child_name, child) in &collection.collections {
            self.declare_tree(child_name, child, Some(id))?;
        }
        Ok(id)
    }

    /// Declare a collection schema. A subcollection registers itself with its
    /// parent, which makes it show up in the `children` of every document the
    /// parent returns.
    pub fn declare(&mut self, declaration: ModelDeclaration) -> Result<SchemaId> {
        let ModelDeclaration {
            name,
            properties,
            defaults,
            parent,
        } = declaration;

        if name.is_empty() {
            return Err(DocModelError::Configuration(
                "collection name is required".into(),
            ));
        }
        validate_id(&name).map_err(|e| {
            DocModelError::Configuration(format!("collection name '{name}' is invalid: {e}"))
        })?;

        let siblings = match parent {
            Some(parent_id) => {
                let parent_node = self.get(parent_id).ok_or_else(|| {
                    DocModelError::Configuration(format!(
                        "parent of '{name}' is not declared in this registry"
                    ))
                })?;
                &parent_node.children
            }
            None => &self.roots,
        };
        if siblings.contains_key(&name) {
            return Err(DocModelError::Configuration(format!(
                "collection '{name}' is already declared at this level"
            )));
        }

        let sanitizer = Sanitizer::new(properties, defaults).map_err(|e| match e {
            DocModelError::Configuration(msg) => {
                DocModelError::Configuration(format!("collection '{name}': {msg}"))
            }
            other => other,
        })?;

        let id = SchemaId(self.nodes.len());
        self.nodes.push(SchemaNode {
            name: name.clone(),
            parent,
            children: BTreeMap::new(),
            sanitizer,
        });

        match parent {
            Some(parent_id) => {
                self.nodes[parent_id.0].children.insert(name.clone(), id);
            }
            None => {
                self.roots.insert(name.clone(), id);
            }
        }

        log::debug!("Declared collection schema '{}'", self.qualified_name(id));
        Ok(id)
    }

    pub fn get(&self, id: SchemaId) -> Option<&SchemaNode> {
        self.nodes.get(id.0)
    }

    /// Look up a top-level collection by name.
    pub fn find(&self, name: &str) -> Option<SchemaId> {
        self.roots.get(name).copied()
    }

    /// Look up a collection by its chain of names from the top level,
    /// e.g. `["profiles", "groups"]`.
    pub fn find_path(&self, names: &[&str]) -> Option<SchemaId> {
        let (first, rest) = names.split_first()?;
        let mut current = self.find(first)?;
        for name in rest {
            current = *self[current].children.get(*name)?;
        }
        Some(current)
    }

    /// Top-level collections keyed by name.
    pub fn roots(&self) -> &BTreeMap<String, SchemaId> {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Collection names from the top level down to `id`.
    pub fn lineage(&self, id: SchemaId) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = self.get(id);
        while let Some(node) = current {
            names.push(node.name.as_str());
            current = node.parent.and_then(|p| self.get(p));
        }
        names.reverse();
        names
    }

    /// Slash-joined lineage, used in log and error messages.
    pub fn qualified_name(&self, id: SchemaId) -> String {
        self.lineage(id).join("/")
    }
}

impl Index<SchemaId> for SchemaRegistry {
    type Output = SchemaNode;

    fn index(&self, id: SchemaId) -> &SchemaNode {
        &self.nodes[id.0]
    }
}
