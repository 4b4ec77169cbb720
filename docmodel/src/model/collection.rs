use super::options::{DeleteOptions, ReadOptions, WriteOptions};
use super::{Database, SubmodelInstance};
use crate::batch::Autobatcher;
use crate::document::{DocumentRef, Fields, RawDocument, SanitizedDocument};
use crate::error::Result;
use crate::listener::{ListenerGuard, ListenerRegistry, WatchedListener};
use crate::path::{validate_id, DocPath};
use crate::sanitizer::Sanitizer;
use crate::schema::{SchemaId, SchemaNode};
use crate::store::{PendingWrite, QueryConstraint, Subscription, Transaction, WriteMode};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A collection schema resolved to one concrete collection path.
#[derive(Clone)]
pub(crate) struct CollectionContext {
    db: Database,
    schema: SchemaId,
    path: DocPath,
}

impl CollectionContext {
    pub(crate) fn new(db: Database, schema: SchemaId, path: DocPath) -> Self {
        debug_assert!(path.is_collection(), "{path} is not a collection path");
        CollectionContext { db, schema, path }
    }

    fn node(&self) -> &SchemaNode {
        &self.db.schema()[self.schema]
    }

    fn sanitizer(&self) -> &Sanitizer {
        self.node().sanitizer()
    }

    pub(crate) fn document_path(&self, id: &str) -> Result<DocPath> {
        validate_id(id)?;
        Ok(self.path.child(id))
    }

    /// One instance per registered subcollection, bound to `document`.
    pub(crate) fn children_for(&self, document: &DocPath) -> BTreeMap<String, SubmodelInstance> {
        self.node()
            .children()
            .iter()
            .map(|(name, child)| {
                let instance = SubmodelInstance::bind(self.db.clone(), *child, document.child(name));
                (name.clone(), instance)
            })
            .collect()
    }

    fn finish(&self, mut document: SanitizedDocument) -> SanitizedDocument {
        document.children = self.children_for(document.path());
        document
    }

    pub(crate) async fn write_new(&self, data: &Value, options: &WriteOptions<'_>) -> Result<SanitizedDocument> {
        options.validate()?;
        let fields = self.sanitizer().prepare_for_write(data, options.merge_defaults);
        let path = self.path.child(&self.db.store().new_document_id());
        let write = PendingWrite::set(path.clone(), fields.clone(), WriteMode::Create);
        self.dispatch(write, options.autobatcher, options.transaction).await?;
        log::debug!("Created document {path}");
        Ok(self.finish(self.sanitizer().written_document(DocumentRef::new(path), fields)))
    }

    pub(crate) async fn write_id(
        &self,
        id: &str,
        data: &Value,
        options: &WriteOptions<'_>,
    ) -> Result<SanitizedDocument> {
        options.validate()?;
        let path = self.document_path(id)?;

        let sanitizer = self.sanitizer();
        let (fields, mode, defaults) = if options.merge_existing {
            // The store fills defaults for what the merged document still lacks.
            let defaults = if options.merge_defaults {
                sanitizer.defaults().clone()
            } else {
                Fields::new()
            };
            (sanitizer.prepare_for_write(data, false), WriteMode::Merge, defaults)
        } else {
            let fields = sanitizer.prepare_for_write(data, options.merge_defaults);
            (fields, WriteMode::Overwrite, Fields::new())
        };

        let write = PendingWrite::set(path.clone(), fields.clone(), mode).with_defaults(defaults);
        self.dispatch(write, options.autobatcher, options.transaction).await?;
        Ok(self.finish(self.sanitizer().written_document(DocumentRef::new(path), fields)))
    }

    pub(crate) async fn get_id(&self, id: &str, options: &ReadOptions<'_>) -> Result<Option<SanitizedDocument>> {
        let path = self.document_path(id)?;
        let raw = match options.transaction {
            Some(tx) => tx.get(&path).await?,
            None => self.db.store().get(&path).await?,
        };
        Ok(self
            .sanitizer()
            .sanitize_document(&raw)
            .map(|doc| self.finish(doc)))
    }

    pub(crate) async fn query(&self, constraints: &[QueryConstraint]) -> Result<Vec<SanitizedDocument>> {
        let raw = self.db.store().query(&self.path, constraints).await?;
        Ok(self
            .sanitizer()
            .sanitize_documents(&raw)
            .into_iter()
            .map(|doc| self.finish(doc))
            .collect())
    }

    pub(crate) async fn delete_id(&self, id: &str, options: &DeleteOptions<'_>) -> Result<()> {
        options.validate()?;
        let path = self.document_path(id)?;
        self.dispatch(PendingWrite::Delete { path }, options.autobatcher, options.transaction)
            .await
    }

    async fn dispatch(
        &self,
        write: PendingWrite,
        autobatcher: Option<&Autobatcher>,
        transaction: Option<&dyn Transaction>,
    ) -> Result<()> {
        match (transaction, autobatcher) {
            (Some(tx), _) => tx.write(write),
            (None, Some(batcher)) => batcher.enqueue(write).await,
            (None, None) => self.db.store().commit_batch(vec![write]).await,
        }
    }

    pub(crate) fn subscribe_document<F>(&self, id: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(Option<SanitizedDocument>) + Send + Sync + 'static,
    {
        let path = self.document_path(id)?;
        let ctx = self.clone();
        self.db.store().subscribe_document(
            &path,
            Arc::new(move |raw: RawDocument| {
                callback(ctx.sanitizer().sanitize_document(&raw).map(|doc| ctx.finish(doc)));
            }),
        )
    }

    pub(crate) fn subscribe_query<F>(&self, constraints: &[QueryConstraint], callback: F) -> Result<Subscription>
    where
        F: Fn(Vec<SanitizedDocument>) + Send + Sync + 'static,
    {
        let ctx = self.clone();
        self.db.store().subscribe_query(
            &self.path,
            constraints,
            Arc::new(move |raw: Vec<RawDocument>| {
                let docs = ctx
                    .sanitizer()
                    .sanitize_documents(&raw)
                    .into_iter()
                    .map(|doc| ctx.finish(doc))
                    .collect();
                callback(docs);
            }),
        )
    }
}

/// State shared by every collection handle: where the collection lives and
/// the listeners registered through this handle.
#[derive(Clone)]
pub struct CollectionHandle {
    ctx: CollectionContext,
    listeners: ListenerRegistry,
}

impl CollectionHandle {
    pub(crate) fn new(ctx: CollectionContext) -> Self {
        CollectionHandle {
            ctx,
            listeners: ListenerRegistry::new(),
        }
    }

    pub(crate) fn context(&self) -> &CollectionContext {
        &self.ctx
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("path", &self.ctx.path.to_string())
            .field("listeners", &self.listeners)
            .finish()
    }
}

/// Operations shared by top-level collections ([`Model`](super::Model)) and
/// subcollections bound to a parent document ([`SubmodelInstance`]).
///
/// Implementors only supply [`handle`](Self::handle); everything else is
/// provided. Usable as a trait object; the callback-generic listener
/// methods are only available on concrete types.
#[async_trait]
pub trait DocumentCollectionOperations: Send + Sync {
    fn handle(&self) -> &CollectionHandle;

    /// Collection name, the last segment of [`path`](Self::path).
    fn name(&self) -> &str {
        self.handle().ctx.node().name()
    }

    fn path(&self) -> &DocPath {
        &self.handle().ctx.path
    }

    fn schema_id(&self) -> SchemaId {
        self.handle().ctx.schema
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.handle().listeners
    }

    /// Create a document under a store-generated identifier.
    ///
    /// With an autobatcher the write is only queued, so the returned
    /// document may not exist in the store yet.
    async fn write_to_new_doc(&self, data: &Value, options: &WriteOptions<'_>) -> Result<SanitizedDocument> {
        self.handle().ctx.write_new(data, options).await
    }

    /// Write the document `id`, replacing it unless `merge_existing` is set.
    /// Returns the written fields.
    async fn write_to_id(&self, id: &str, data: &Value, options: &WriteOptions<'_>) -> Result<SanitizedDocument> {
        self.handle().ctx.write_id(id, data, options).await
    }

    async fn get_by_id(&self, id: &str, options: &ReadOptions<'_>) -> Result<Option<SanitizedDocument>> {
        self.handle().ctx.get_id(id, options).await
    }

    async fn get_by_query(&self, constraints: &[QueryConstraint]) -> Result<Vec<SanitizedDocument>> {
        self.handle().ctx.query(constraints).await
    }

    async fn delete_by_id(&self, id: &str, options: &DeleteOptions<'_>) -> Result<()> {
        self.handle().ctx.delete_id(id, options).await
    }

    /// Listen to one document under `name`. The callback gets `None` while
    /// the document does not exist.
    fn add_listener_by_id<F>(&self, name: &str, id: &str, callback: F) -> Result<()>
    where
        Self: Sized,
        F: Fn(Option<SanitizedDocument>) + Send + Sync + 'static,
    {
        let ctx = &self.handle().ctx;
        self.listeners()
            .register(name, || ctx.subscribe_document(id, callback))
            .map(drop)
    }

    /// Listen to a query under `name`. The callback gets the whole result
    /// set on every change.
    fn add_listener_by_query<F>(&self, name: &str, constraints: &[QueryConstraint], callback: F) -> Result<()>
    where
        Self: Sized,
        F: Fn(Vec<SanitizedDocument>) + Send + Sync + 'static,
    {
        let ctx = &self.handle().ctx;
        self.listeners()
            .register(name, || ctx.subscribe_query(constraints, callback))
            .map(drop)
    }

    fn add_scoped_listener_by_id<F>(&self, name: &str, id: &str, callback: F) -> Result<ListenerGuard>
    where
        Self: Sized,
        F: Fn(Option<SanitizedDocument>) + Send + Sync + 'static,
    {
        let ctx = &self.handle().ctx;
        self.listeners()
            .register_scoped(name, || ctx.subscribe_document(id, callback))
    }

    fn add_scoped_listener_by_query<F>(
        &self,
        name: &str,
        constraints: &[QueryConstraint],
        callback: F,
    ) -> Result<ListenerGuard>
    where
        Self: Sized,
        F: Fn(Vec<SanitizedDocument>) + Send + Sync + 'static,
    {
        let ctx = &self.handle().ctx;
        self.listeners()
            .register_scoped(name, || ctx.subscribe_query(constraints, callback))
    }

    /// Scoped listener mirroring the latest document into observable state.
    fn watch_by_id(&self, name: &str, id: &str) -> Result<WatchedListener<Option<SanitizedDocument>>> {
        let ctx = &self.handle().ctx;
        WatchedListener::register(self.listeners(), name, |publisher| {
            ctx.subscribe_document(id, move |doc| publisher.publish(doc))
        })
    }

    /// Scoped listener mirroring the latest result set into observable state.
    fn watch_by_query(
        &self,
        name: &str,
        constraints: &[QueryConstraint],
    ) -> Result<WatchedListener<Vec<SanitizedDocument>>> {
        let ctx = &self.handle().ctx;
        WatchedListener::register(self.listeners(), name, |publisher| {
            ctx.subscribe_query(constraints, move |docs| publisher.publish(docs))
        })
    }

    /// Returns whether a listener was registered under `name`.
    fn remove_listener(&self, name: &str) -> bool {
        self.listeners().remove(name)
    }

    fn remove_all_listeners(&self) {
        self.listeners().remove_all();
    }
}
