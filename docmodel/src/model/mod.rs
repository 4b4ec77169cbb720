// Collection handles over a document store

mod collection;
mod options;
mod submodel;

pub use collection::{CollectionHandle, DocumentCollectionOperations};
pub use options::{DeleteOptions, ReadOptions, WriteOptions};
pub use submodel::Submodel;

use crate::batch::Autobatcher;
use crate::document::DocumentRef;
use crate::error::{DocModelError, Result};
use crate::path::DocPath;
use crate::schema::{parse_schema, SchemaId, SchemaRegistry};
use crate::store::{DocumentStore, Transaction};
use collection::CollectionContext;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

struct DatabaseInner {
    store: Arc<dyn DocumentStore>,
    schema: SchemaRegistry,
}

/// A document store together with the collection schemas declared for it.
/// Cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn new(store: Arc<dyn DocumentStore>, schema: SchemaRegistry) -> Self {
        log::debug!("Opened database with {} collection schemas", schema.len());
        Database {
            inner: Arc::new(DatabaseInner { store, schema }),
        }
    }

    /// Declare every collection in a YAML schema file.
    pub fn from_schema_file(store: Arc<dyn DocumentStore>, path: &Path) -> Result<Self> {
        let definition = parse_schema(path)?;
        let schema = SchemaRegistry::from_definition(&definition)?;
        Ok(Database::new(store, schema))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.inner.schema
    }

    /// Handle for the top-level collection `name`.
    pub fn model(&self, name: &str) -> Result<Model> {
        let id = self.schema().find(name).ok_or_else(|| {
            DocModelError::Configuration(format!("no top-level collection named '{name}'"))
        })?;
        self.model_by_id(id)
    }

    pub fn model_by_id(&self, id: SchemaId) -> Result<Model> {
        let node = self.node(id)?;
        if node.parent().is_some() {
            return Err(DocModelError::Configuration(format!(
                "'{}' is a subcollection; use a submodel",
                self.schema().qualified_name(id)
            )));
        }
        let ctx = CollectionContext::new(self.clone(), id, DocPath::root().child(node.name()));
        Ok(Model {
            handle: CollectionHandle::new(ctx),
        })
    }

    /// Path-addressed handle for a collection, named by its chain of
    /// collection names, e.g. `&["profiles", "groups"]`.
    pub fn submodel(&self, names: &[&str]) -> Result<Submodel> {
        let id = self.schema().find_path(names).ok_or_else(|| {
            DocModelError::Configuration(format!("no collection at '{}'", names.join("/")))
        })?;
        self.submodel_by_id(id)
    }

    pub fn submodel_by_id(&self, id: SchemaId) -> Result<Submodel> {
        self.node(id)?;
        Ok(Submodel::new(self.clone(), id))
    }

    /// New batcher over this database's store, using the store's batch limit.
    pub fn autobatcher(&self) -> Autobatcher {
        Autobatcher::new(self.inner.store.clone())
    }

    pub async fn transaction(&self) -> Result<Box<dyn Transaction>> {
        self.inner.store.begin_transaction().await
    }

    fn node(&self, id: SchemaId) -> Result<&crate::schema::SchemaNode> {
        self.schema()
            .get(id)
            .ok_or_else(|| DocModelError::Configuration(format!("unknown schema {id:?}")))
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("collections", &self.schema().roots().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Handle for a top-level collection.
#[derive(Debug)]
pub struct Model {
    handle: CollectionHandle,
}

impl Model {
    /// Subcollection instances for the document `id`, without reading it.
    pub fn children_for(&self, id: &str) -> Result<BTreeMap<String, SubmodelInstance>> {
        let ctx = self.handle.context();
        Ok(ctx.children_for(&ctx.document_path(id)?))
    }
}

impl DocumentCollectionOperations for Model {
    fn handle(&self) -> &CollectionHandle {
        &self.handle
    }
}

/// A subcollection bound to one parent document.
#[derive(Clone)]
pub struct SubmodelInstance {
    handle: CollectionHandle,
}

impl SubmodelInstance {
    pub(crate) fn bind(db: Database, schema: SchemaId, path: DocPath) -> Self {
        SubmodelInstance {
            handle: CollectionHandle::new(CollectionContext::new(db, schema, path)),
        }
    }

    /// The document this subcollection lives under, `None` for a top-level
    /// collection.
    pub fn parent(&self) -> Option<DocumentRef> {
        self.path()
            .parent()
            .filter(|path| path.is_document())
            .map(DocumentRef::new)
    }
}

impl DocumentCollectionOperations for SubmodelInstance {
    fn handle(&self) -> &CollectionHandle {
        &self.handle
    }
}

impl fmt::Debug for SubmodelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmodelInstance")
            .field("path", &self.path().to_string())
            .finish()
    }
}
