use super::collection::CollectionContext;
use super::options::{DeleteOptions, ReadOptions, WriteOptions};
use super::{CollectionHandle, Database, SubmodelInstance};
use crate::document::SanitizedDocument;
use crate::error::{DocModelError, Result};
use crate::listener::{ListenerGuard, ListenerRegistry};
use crate::path::DocPath;
use crate::schema::SchemaId;
use crate::store::QueryConstraint;
use serde_json::Value;
use std::fmt;

/// Collection handle addressed by full paths instead of bare identifiers.
///
/// Every path is checked against the schema lineage before any I/O: a
/// `groups` submodel under `profiles` accepts `profiles/p1/groups/g1` but
/// rejects `teams/t1/groups/g1` with [`DocModelError::PathMismatch`].
pub struct Submodel {
    db: Database,
    schema: SchemaId,
    listeners: ListenerRegistry,
}

impl Submodel {
    pub(crate) fn new(db: Database, schema: SchemaId) -> Self {
        Submodel {
            db,
            schema,
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.db.schema()[self.schema].name()
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    fn mismatch(&self, path: &str) -> DocModelError {
        DocModelError::PathMismatch {
            expected: self.db.schema().qualified_name(self.schema),
            path: path.to_string(),
        }
    }

    /// Context for this collection under `parent`, which must be a document
    /// of the parent schema (or the root for a top-level collection).
    fn context_under(&self, parent: &DocPath) -> Result<CollectionContext> {
        let collection = parent.child(self.name());
        let lineage = self.db.schema().lineage(self.schema);
        let expected_parents = &lineage[..lineage.len() - 1];

        let parent_collections: Vec<&str> = parent
            .segments()
            .iter()
            .step_by(2)
            .map(String::as_str)
            .collect();
        if !(parent.is_root() || parent.is_document()) || parent_collections != expected_parents {
            return Err(self.mismatch(&collection.to_string()));
        }
        Ok(CollectionContext::new(self.db.clone(), self.schema, collection))
    }

    /// Split a document path into its collection context and identifier.
    fn locate(&self, path: &str) -> Result<(CollectionContext, String)> {
        let parsed = DocPath::parse(path)?;
        if !parsed.is_document() || parsed.collection_id() != Some(self.name()) {
            return Err(self.mismatch(path));
        }
        let id = parsed.last().unwrap_or_default().to_string();
        let parent = parsed
            .parent()
            .and_then(|collection| collection.parent())
            .unwrap_or_default();
        Ok((self.context_under(&parent)?, id))
    }

    /// Bind this collection to the document at `parent`.
    pub fn instance(&self, parent: &str) -> Result<SubmodelInstance> {
        let ctx = self.context_under(&DocPath::parse(parent)?)?;
        Ok(SubmodelInstance {
            handle: CollectionHandle::new(ctx),
        })
    }

    pub async fn write_to_path(&self, path: &str, data: &Value, options: &WriteOptions<'_>) -> Result<SanitizedDocument> {
        let (ctx, id) = self.locate(path)?;
        ctx.write_id(&id, data, options).await
    }

    pub async fn get_by_path(&self, path: &str, options: &ReadOptions<'_>) -> Result<Option<SanitizedDocument>> {
        let (ctx, id) = self.locate(path)?;
        ctx.get_id(&id, options).await
    }

    pub async fn delete_by_path(&self, path: &str, options: &DeleteOptions<'_>) -> Result<()> {
        let (ctx, id) = self.locate(path)?;
        ctx.delete_id(&id, options).await
    }

    /// Create a document with a generated identifier under `parent`.
    pub async fn write_to_new_doc_in(
        &self,
        parent: &str,
        data: &Value,
        options: &WriteOptions<'_>,
    ) -> Result<SanitizedDocument> {
        let ctx = self.context_under(&DocPath::parse(parent)?)?;
        ctx.write_new(data, options).await
    }

    pub async fn get_by_query_in(&self, parent: &str, constraints: &[QueryConstraint]) -> Result<Vec<SanitizedDocument>> {
        let ctx = self.context_under(&DocPath::parse(parent)?)?;
        ctx.query(constraints).await
    }

    pub fn add_listener_by_path<F>(&self, name: &str, path: &str, callback: F) -> Result<()>
    where
        F: Fn(Option<SanitizedDocument>) + Send + Sync + 'static,
    {
        let (ctx, id) = self.locate(path)?;
        self.listeners
            .register(name, || ctx.subscribe_document(&id, callback))
            .map(drop)
    }

    pub fn add_scoped_listener_by_path<F>(&self, name: &str, path: &str, callback: F) -> Result<ListenerGuard>
    where
        F: Fn(Option<SanitizedDocument>) + Send + Sync + 'static,
    {
        let (ctx, id) = self.locate(path)?;
        self.listeners
            .register_scoped(name, || ctx.subscribe_document(&id, callback))
    }

    pub fn add_listener_by_query_in<F>(
        &self,
        name: &str,
        parent: &str,
        constraints: &[QueryConstraint],
        callback: F,
    ) -> Result<()>
    where
        F: Fn(Vec<SanitizedDocument>) + Send + Sync + 'static,
    {
        let ctx = self.context_under(&DocPath::parse(parent)?)?;
        self.listeners
            .register(name, || ctx.subscribe_query(constraints, callback))
            .map(drop)
    }

    pub fn remove_listener(&self, name: &str) -> bool {
        self.listeners.remove(name)
    }

    pub fn remove_all_listeners(&self) {
        self.listeners.remove_all();
    }
}

impl fmt::Debug for Submodel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submodel")
            .field("collection", &self.db.schema().qualified_name(self.schema))
            .field("listeners", &self.listeners)
            .finish()
    }
}
