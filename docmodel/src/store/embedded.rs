use super::query::apply_constraints;
use super::{
    DocumentCallback, DocumentStore, PendingWrite, QueryCallback, QueryConstraint, StoreConfig,
    Subscription, Transaction, WriteMode,
};
use crate::document::{DocumentRef, Fields, RawDocument};
use crate::error::{DocModelError, Result};
use crate::path::DocPath;
use crate::watcher::{Snapshot, SnapshotSource, WatchHub, WatchTarget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// A document as an embedded backend keeps it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub fields: Fields,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    /// Monotonic write counter, used for transaction preconditions.
    pub version: u64,
}

impl StoredDocument {
    fn into_raw(self, reference: DocumentRef) -> RawDocument {
        RawDocument {
            reference,
            fields: Some(self.fields),
            create_time: Some(self.create_time),
            update_time: Some(self.update_time),
        }
    }
}

/// The version a transaction observed for a document; `None` means the
/// document did not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub path: DocPath,
    pub version: Option<u64>,
}

/// Storage engine behind an [`EmbeddedStore`].
pub trait Backend: Send + Sync + 'static {
    fn read(&self, path: &DocPath) -> Result<Option<StoredDocument>>;

    /// Documents directly inside `collection`, in identifier order.
    fn list(&self, collection: &DocPath) -> Result<Vec<(DocPath, StoredDocument)>>;

    /// Check every precondition, then apply the writes in order, all or
    /// nothing. Returns the paths that changed.
    fn apply(&self, writes: &[PendingWrite], preconditions: &[Precondition]) -> Result<Vec<DocPath>>;
}

/// Fail with [`DocModelError::Contention`] if a document moved on since a
/// transaction read it.
pub fn check_precondition(current: Option<&StoredDocument>, precondition: &Precondition) -> Result<()> {
    if current.map(|doc| doc.version) != precondition.version {
        return Err(DocModelError::Contention {
            path: precondition.path.to_string(),
        });
    }
    Ok(())
}

/// The state of a document after one write. `None` means deleted.
pub fn resolve_write(
    existing: Option<&StoredDocument>,
    write: &PendingWrite,
    version: u64,
    now: DateTime<Utc>,
) -> Result<Option<StoredDocument>> {
    let (path, fields, mode, defaults) = match write {
        PendingWrite::Delete { .. } => return Ok(None),
        PendingWrite::Set {
            path,
            fields,
            mode,
            defaults,
        } => (path, fields, mode, defaults),
    };

    let mut fields = match (mode, existing) {
        (WriteMode::Create, Some(_)) => {
            return Err(DocModelError::AlreadyExists {
                path: path.to_string(),
            });
        }
        (WriteMode::Merge, Some(current)) => {
            let mut merged = current.fields.clone();
            merge_fields(&mut merged, fields);
            merged
        }
        _ => fields.clone(),
    };
    for (key, value) in defaults {
        fields.entry(key.clone()).or_insert_with(|| value.clone());
    }

    Ok(Some(StoredDocument {
        fields,
        create_time: existing.map(|doc| doc.create_time).unwrap_or(now),
        update_time: now,
        version,
    }))
}

/// Overlay `overlay` onto `base`, merging nested objects key by key.
fn merge_fields(base: &mut Fields, overlay: &Fields) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_fields(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn ensure_document(path: &DocPath) -> Result<()> {
    if !path.is_document() {
        return Err(DocModelError::InvalidPath(format!(
            "'{path}' does not address a document"
        )));
    }
    Ok(())
}

fn ensure_collection(path: &DocPath) -> Result<()> {
    if !path.is_collection() {
        return Err(DocModelError::InvalidPath(format!(
            "'{path}' does not address a collection"
        )));
    }
    Ok(())
}

impl<B: Backend> SnapshotSource for B {
    fn snapshot_document(&self, path: &DocPath) -> Result<RawDocument> {
        let reference = DocumentRef::new(path.clone());
        Ok(match self.read(path)? {
            Some(doc) => doc.into_raw(reference),
            None => RawDocument::missing(reference),
        })
    }

    fn snapshot_query(
        &self,
        collection: &DocPath,
        constraints: &[QueryConstraint],
    ) -> Result<Vec<RawDocument>> {
        let documents = self
            .list(collection)?
            .into_iter()
            .map(|(path, doc)| doc.into_raw(DocumentRef::new(path)))
            .collect();
        Ok(apply_constraints(documents, constraints))
    }
}

/// [`DocumentStore`] over an in-process [`Backend`]: batches and transactions
/// commit through `Backend::apply`, realtime pushes come from a shared hub.
pub struct EmbeddedStore<B: Backend> {
    backend: Arc<B>,
    hub: Arc<WatchHub>,
    config: StoreConfig,
}

impl<B: Backend> EmbeddedStore<B> {
    pub fn with_backend(backend: B, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(EmbeddedStore::assemble(backend, config))
    }

    /// `config` must already be valid.
    pub(super) fn assemble(backend: B, config: StoreConfig) -> Self {
        EmbeddedStore {
            backend: Arc::new(backend),
            hub: WatchHub::new(),
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of live realtime subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.hub.len()
    }
}

#[async_trait]
impl<B: Backend> DocumentStore for EmbeddedStore<B> {
    fn new_document_id(&self) -> String {
        self.config.auto_id.generate()
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    async fn get(&self, path: &DocPath) -> Result<RawDocument> {
        ensure_document(path)?;
        self.backend.snapshot_document(path)
    }

    async fn query(
        &self,
        collection: &DocPath,
        constraints: &[QueryConstraint],
    ) -> Result<Vec<RawDocument>> {
        ensure_collection(collection)?;
        self.backend.snapshot_query(collection, constraints)
    }

    async fn commit_batch(&self, writes: Vec<PendingWrite>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        if writes.len() > self.config.max_batch_size {
            return Err(DocModelError::BatchTooLarge {
                size: writes.len(),
                limit: self.config.max_batch_size,
            });
        }
        for write in &writes {
            ensure_document(write.path())?;
        }

        let changed = self.backend.apply(&writes, &[])?;
        log::debug!("Committed batch of {} writes", writes.len());
        self.hub.notify(self.backend.as_ref(), &changed);
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(EmbeddedTransaction {
            backend: self.backend.clone(),
            hub: self.hub.clone(),
            state: Mutex::new(TransactionState::default()),
        }))
    }

    fn subscribe_document(
        &self,
        path: &DocPath,
        callback: DocumentCallback,
    ) -> Result<Subscription> {
        ensure_document(path)?;
        self.hub.watch(
            self.backend.as_ref(),
            WatchTarget::Document(path.clone()),
            move |snapshot| {
                if let Snapshot::Document(doc) = snapshot {
                    callback(doc);
                }
            },
        )
    }

    fn subscribe_query(
        &self,
        collection: &DocPath,
        constraints: &[QueryConstraint],
        callback: QueryCallback,
    ) -> Result<Subscription> {
        ensure_collection(collection)?;
        self.hub.watch(
            self.backend.as_ref(),
            WatchTarget::Query {
                collection: collection.clone(),
                constraints: constraints.to_vec(),
            },
            move |snapshot| {
                if let Snapshot::Query(docs) = snapshot {
                    callback(docs);
                }
            },
        )
    }
}

#[derive(Default)]
struct TransactionState {
    reads: Vec<Precondition>,
    writes: Vec<PendingWrite>,
}

/// Optimistic transaction: reads record the version they saw, writes are
/// buffered, and commit fails if any read document changed in between.
struct EmbeddedTransaction<B: Backend> {
    backend: Arc<B>,
    hub: Arc<WatchHub>,
    state: Mutex<TransactionState>,
}

impl<B: Backend> EmbeddedTransaction<B> {
    fn buffer(&self, write: PendingWrite) -> Result<()> {
        ensure_document(write.path())?;
        self.state.lock().writes.push(write);
        Ok(())
    }
}

#[async_trait]
impl<B: Backend> Transaction for EmbeddedTransaction<B> {
    async fn get(&self, path: &DocPath) -> Result<RawDocument> {
        ensure_document(path)?;
        if !self.state.lock().writes.is_empty() {
            return Err(DocModelError::Store(
                "transaction reads must happen before writes".into(),
            ));
        }

        let stored = self.backend.read(path)?;
        {
            let mut state = self.state.lock();
            if !state.reads.iter().any(|read| &read.path == path) {
                state.reads.push(Precondition {
                    path: path.clone(),
                    version: stored.as_ref().map(|doc| doc.version),
                });
            }
        }

        let reference = DocumentRef::new(path.clone());
        Ok(match stored {
            Some(doc) => doc.into_raw(reference),
            None => RawDocument::missing(reference),
        })
    }

    fn write(&self, write: PendingWrite) -> Result<()> {
        self.buffer(write)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let state = std::mem::take(&mut *self.state.lock());
        if state.writes.is_empty() {
            return Ok(());
        }

        let changed = self.backend.apply(&state.writes, &state.reads)?;
        log::debug!(
            "Committed transaction with {} reads and {} writes",
            state.reads.len(),
            state.writes.len()
        );
        self.hub.notify(self.backend.as_ref(), &changed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn stored(value: Value, version: u64) -> StoredDocument {
        let now = Utc::now();
        StoredDocument {
            fields: fields(value),
            create_time: now,
            update_time: now,
            version,
        }
    }

    fn set(mode: WriteMode, value: Value) -> PendingWrite {
        PendingWrite::set(DocPath::parse("profiles/a").unwrap(), fields(value), mode)
    }

    #[test]
    fn test_create_conflicts_with_existing() {
        let existing = stored(json!({"name": "ann"}), 1);
        let err = resolve_write(Some(&existing), &set(WriteMode::Create, json!({})), 2, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DocModelError::AlreadyExists { .. }));
    }

    #[test]
    fn test_overwrite_replaces_fields_keeps_create_time() {
        let existing = stored(json!({"name": "ann", "email": "a@x.io"}), 1);
        let next = resolve_write(
            Some(&existing),
            &set(WriteMode::Overwrite, json!({"name": "bob"})),
            2,
            Utc::now(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(next.fields, fields(json!({"name": "bob"})));
        assert_eq!(next.create_time, existing.create_time);
        assert_eq!(next.version, 2);
    }

    #[test]
    fn test_merge_is_deep() {
        let existing = stored(json!({"name": "ann", "prefs": {"theme": "dark", "lang": "en"}}), 1);
        let next = resolve_write(
            Some(&existing),
            &set(WriteMode::Merge, json!({"prefs": {"lang": "no"}})),
            2,
            Utc::now(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            next.fields,
            fields(json!({"name": "ann", "prefs": {"theme": "dark", "lang": "no"}}))
        );
    }

    #[test]
    fn test_merge_into_missing_creates() {
        let next = resolve_write(None, &set(WriteMode::Merge, json!({"name": "ann"})), 1, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(next.fields, fields(json!({"name": "ann"})));
    }

    #[test]
    fn test_delete_resolves_to_none() {
        let existing = stored(json!({"name": "ann"}), 1);
        let write = PendingWrite::Delete {
            path: DocPath::parse("profiles/a").unwrap(),
        };
        assert!(resolve_write(Some(&existing), &write, 2, Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_precondition() {
        let path = DocPath::parse("profiles/a").unwrap();
        let existing = stored(json!({}), 3);
        assert!(check_precondition(
            Some(&existing),
            &Precondition { path: path.clone(), version: Some(3) }
        )
        .is_ok());
        assert!(check_precondition(
            Some(&existing),
            &Precondition { path: path.clone(), version: Some(2) }
        )
        .is_err());
        assert!(check_precondition(None, &Precondition { path, version: None }).is_ok());
    }

    #[test]
    fn test_defaults_fill_only_what_merge_leaves_missing() {
        let existing = stored(json!({"name": "ann", "email": "a@x.io"}), 1);
        let write = set(WriteMode::Merge, json!({"name": "bob"}))
            .with_defaults(fields(json!({"email": "n/a", "role": "guest", "name": "?"})));

        let next = resolve_write(Some(&existing), &write, 2, Utc::now()).unwrap().unwrap();
        assert_eq!(
            next.fields,
            fields(json!({"name": "bob", "email": "a@x.io", "role": "guest"}))
        );

        let created = resolve_write(None, &write, 1, Utc::now()).unwrap().unwrap();
        assert_eq!(
            created.fields,
            fields(json!({"name": "bob", "email": "n/a", "role": "guest"}))
        );
    }

    async fn conformance<S: DocumentStore>(store: S) {
        let a = DocPath::parse("profiles/a").unwrap();
        let collection = DocPath::parse("profiles").unwrap();

        store.set(&a, fields(json!({"name": "ann"})), WriteMode::Create).await.unwrap();
        let err = store.set(&a, fields(json!({})), WriteMode::Create).await.unwrap_err();
        assert!(matches!(err, DocModelError::AlreadyExists { .. }));

        let doc = store.get(&a).await.unwrap();
        assert_eq!(doc.fields.unwrap()["name"], json!("ann"));
        assert!(doc.create_time.is_some());

        assert!(store.get(&collection).await.is_err());
        assert!(store.query(&a, &[]).await.is_err());

        store.delete(&a).await.unwrap();
        assert!(!store.get(&a).await.unwrap().exists());
        assert!(store.query(&collection, &[]).await.unwrap().is_empty());

        let too_many = (0..store.max_batch_size() + 1)
            .map(|i| PendingWrite::Delete { path: collection.child(&format!("d{i}")) })
            .collect();
        let err = store.commit_batch(too_many).await.unwrap_err();
        assert!(matches!(err, DocModelError::BatchTooLarge { .. }));
    }

    async fn transaction_contention<S: DocumentStore>(store: S) {
        let a = DocPath::parse("profiles/a").unwrap();
        store.set(&a, fields(json!({"n": 1})), WriteMode::Create).await.unwrap();

        let tx = store.begin_transaction().await.unwrap();
        assert!(tx.get(&a).await.unwrap().exists());
        store.set(&a, fields(json!({"n": 2})), WriteMode::Overwrite).await.unwrap();
        tx.set(&a, fields(json!({"n": 3})), WriteMode::Overwrite).unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, DocModelError::Contention { .. }));

        let tx = store.begin_transaction().await.unwrap();
        tx.get(&a).await.unwrap();
        tx.set(&a, fields(json!({"n": 4})), WriteMode::Merge).unwrap();
        assert!(tx.get(&a).await.is_err());
        tx.commit().await.unwrap();
        assert_eq!(store.get(&a).await.unwrap().fields.unwrap()["n"], json!(4));
    }

    #[tokio::test]
    async fn test_memory_store_conformance() {
        conformance(crate::store::MemoryStore::new()).await;
        transaction_contention(crate::store::MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_conformance() {
        conformance(crate::store::SqliteStore::open_in_memory().unwrap()).await;
        transaction_contention(crate::store::SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_query_subscription_sees_commits() {
        let store = crate::store::MemoryStore::new();
        let collection = DocPath::parse("profiles").unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback: QueryCallback = Arc::new(move |docs: Vec<RawDocument>| {
            let _ = tx.send(docs.len());
        });
        let subscription = store.subscribe_query(&collection, &[], callback).unwrap();
        assert_eq!(rx.recv().await, Some(0));

        store
            .set(&collection.child("a"), fields(json!({"n": 1})), WriteMode::Create)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(store.subscription_count(), 1);

        subscription.unsubscribe();
        assert_eq!(store.subscription_count(), 0);
    }
}
