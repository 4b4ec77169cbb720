// Write coalescing

use crate::document::Fields;
use crate::error::{DocModelError, Result};
use crate::path::DocPath;
use crate::store::{DocumentStore, PendingWrite, WriteMode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Queues [`PendingWrite`]s and commits them through
/// [`DocumentStore::commit_batch`] in chunks of at most `batch_limit`
/// operations. A full queue flushes on its own; anything else waits for
/// [`Autobatcher::flush`].
pub struct Autobatcher {
    store: Arc<dyn DocumentStore>,
    batch_limit: usize,
    queue: Mutex<Vec<PendingWrite>>,
    /// Serializes flushes so chunks reach the store in enqueue order.
    flushing: tokio::sync::Mutex<()>,
    commits: AtomicUsize,
}

impl Autobatcher {
    /// Batcher using the store's own batch limit.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let batch_limit = store.max_batch_size();
        Autobatcher::build(store, batch_limit)
    }

    /// Batcher with a smaller limit. `batch_limit` must lie between 1 and
    /// the store's maximum.
    pub fn with_limit(store: Arc<dyn DocumentStore>, batch_limit: usize) -> Result<Self> {
        let max = store.max_batch_size();
        if batch_limit == 0 || batch_limit > max {
            return Err(DocModelError::Configuration(format!(
                "batch limit must be between 1 and {max}, got {batch_limit}"
            )));
        }
        Ok(Autobatcher::build(store, batch_limit))
    }

    fn build(store: Arc<dyn DocumentStore>, batch_limit: usize) -> Self {
        Autobatcher {
            store,
            batch_limit,
            queue: Mutex::new(Vec::new()),
            flushing: tokio::sync::Mutex::new(()),
            commits: AtomicUsize::new(0),
        }
    }

    /// Queue a set. `merge_existing` keeps fields the payload leaves out.
    pub async fn enqueue_set(&self, path: &DocPath, fields: Fields, merge_existing: bool) -> Result<()> {
        let mode = if merge_existing {
            WriteMode::Merge
        } else {
            WriteMode::Overwrite
        };
        self.enqueue(PendingWrite::set(path.clone(), fields, mode)).await
    }

    pub async fn enqueue_delete(&self, path: &DocPath) -> Result<()> {
        self.enqueue(PendingWrite::Delete { path: path.clone() }).await
    }

    /// Queue any write. Flushes once the queue holds `batch_limit` writes;
    /// a failure of that flush is returned here.
    pub async fn enqueue(&self, write: PendingWrite) -> Result<()> {
        if !write.path().is_document() {
            return Err(DocModelError::InvalidPath(format!(
                "'{}' does not address a document",
                write.path()
            )));
        }

        let full = {
            let mut queue = self.queue.lock();
            queue.push(write);
            queue.len() >= self.batch_limit
        };
        if full {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commit everything queued so far, one chunk of at most `batch_limit`
    /// writes at a time. Writes queued while the flush runs wait for the
    /// next one.
    ///
    /// If a chunk fails, its writes are dropped and the error is returned;
    /// chunks after it go back to the front of the queue.
    pub async fn flush(&self) -> Result<()> {
        let _flushing = self.flushing.lock().await;
        let queued = std::mem::take(&mut *self.queue.lock());
        if queued.is_empty() {
            return Ok(());
        }

        let mut chunks = into_chunks(queued, self.batch_limit);
        while let Some(chunk) = chunks.pop_front() {
            let size = chunk.len();
            if let Err(e) = self.store.commit_batch(chunk).await {
                let remaining: Vec<PendingWrite> = chunks.into_iter().flatten().collect();
                log::warn!(
                    "Batch commit of {size} writes failed, {} writes requeued: {e}",
                    remaining.len()
                );
                if !remaining.is_empty() {
                    self.queue.lock().splice(0..0, remaining);
                }
                return Err(e);
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            log::debug!("Flushed batch of {size} writes");
        }
        Ok(())
    }

    /// Writes waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Physical batches committed so far.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}

fn into_chunks(mut writes: Vec<PendingWrite>, limit: usize) -> VecDeque<Vec<PendingWrite>> {
    let mut chunks = VecDeque::new();
    while writes.len() > limit {
        let rest = writes.split_off(limit);
        chunks.push_back(std::mem::replace(&mut writes, rest));
    }
    if !writes.is_empty() {
        chunks.push_back(writes);
    }
    chunks
}

impl Drop for Autobatcher {
    fn drop(&mut self) {
        let pending = self.queue.get_mut().len();
        if pending > 0 {
            log::warn!("Autobatcher dropped with {pending} unflushed writes");
        }
    }
}

impl fmt::Debug for Autobatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autobatcher")
            .field("batch_limit", &self.batch_limit)
            .field("pending", &self.pending())
            .field("commits", &self.commits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RawDocument;
    use crate::store::{
        DocumentCallback, MemoryStore, QueryCallback, QueryConstraint, Subscription, Transaction,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Store that records batch sizes and fails the commit numbered `fail_on`.
    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<String>>>,
        fail_on: Option<usize>,
    }

    fn unsupported<T>() -> Result<T> {
        Err(DocModelError::Store("not supported by the recording store".into()))
    }

    #[async_trait]
    impl DocumentStore for RecordingStore {
        fn new_document_id(&self) -> String {
            "generated".into()
        }

        fn max_batch_size(&self) -> usize {
            10
        }

        async fn get(&self, _path: &DocPath) -> Result<RawDocument> {
            unsupported()
        }

        async fn query(&self, _collection: &DocPath, _constraints: &[QueryConstraint]) -> Result<Vec<RawDocument>> {
            unsupported()
        }

        async fn commit_batch(&self, writes: Vec<PendingWrite>) -> Result<()> {
            let mut batches = self.batches.lock();
            if self.fail_on == Some(batches.len()) {
                return Err(DocModelError::Store("commit rejected".into()));
            }
            batches.push(writes.iter().map(|w| w.path().id().unwrap_or_default().to_string()).collect());
            Ok(())
        }

        async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
            unsupported()
        }

        fn subscribe_document(&self, _path: &DocPath, _callback: DocumentCallback) -> Result<Subscription> {
            unsupported()
        }

        fn subscribe_query(
            &self,
            _collection: &DocPath,
            _constraints: &[QueryConstraint],
            _callback: QueryCallback,
        ) -> Result<Subscription> {
            unsupported()
        }
    }

    fn doc(id: usize) -> DocPath {
        DocPath::parse(&format!("items/d{id}")).unwrap()
    }

    fn payload() -> Fields {
        json!({"n": 1}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_commits_ceil_n_over_limit() {
        let store = Arc::new(RecordingStore::default());
        let batcher = Autobatcher::with_limit(store.clone(), 3).unwrap();
        for i in 0..7 {
            batcher.enqueue_set(&doc(i), payload(), false).await.unwrap();
        }
        // Two full chunks flushed on their own, one write still queued.
        assert_eq!(batcher.commits(), 2);
        assert_eq!(batcher.pending(), 1);

        batcher.flush().await.unwrap();
        assert_eq!(batcher.commits(), 3);
        assert_eq!(batcher.pending(), 0);
        assert_eq!(
            *store.batches.lock(),
            vec![
                vec!["d0", "d1", "d2"],
                vec!["d3", "d4", "d5"],
                vec!["d6"],
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_empty_queue_is_noop() {
        let store = Arc::new(RecordingStore::default());
        let batcher = Autobatcher::new(store.clone());
        batcher.flush().await.unwrap();
        assert_eq!(batcher.commits(), 0);
        assert!(store.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_limit_validation() {
        let store: Arc<dyn DocumentStore> = Arc::new(RecordingStore::default());
        assert!(matches!(
            Autobatcher::with_limit(store.clone(), 0),
            Err(DocModelError::Configuration(_))
        ));
        assert!(Autobatcher::with_limit(store.clone(), 11).is_err());
        assert_eq!(Autobatcher::new(store).batch_limit(), 10);
    }

    #[tokio::test]
    async fn test_implicit_flush_failure_surfaces() {
        let store = Arc::new(RecordingStore {
            fail_on: Some(0),
            ..RecordingStore::default()
        });
        let batcher = Autobatcher::with_limit(store.clone(), 2).unwrap();
        batcher.enqueue_delete(&doc(0)).await.unwrap();
        let err = batcher.enqueue_delete(&doc(1)).await.unwrap_err();
        assert!(err.is_store_error());
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.commits(), 0);
    }

    #[tokio::test]
    async fn test_failed_chunk_requeues_the_rest() {
        let store = Arc::new(RecordingStore {
            fail_on: Some(1),
            ..RecordingStore::default()
        });
        let batcher = Autobatcher::with_limit(store.clone(), 2).unwrap();
        {
            let mut queue = batcher.queue.lock();
            for i in 0..6 {
                queue.push(PendingWrite::Delete { path: doc(i) });
            }
        }

        assert!(batcher.flush().await.is_err());
        assert_eq!(batcher.commits(), 1);
        // d2 and d3 were in the failed chunk; d4 and d5 wait for the next flush.
        assert_eq!(batcher.pending(), 2);

        batcher.enqueue_delete(&doc(6)).await.unwrap_err();
        assert_eq!(*store.batches.lock(), vec![vec!["d0", "d1"]]);
    }

    #[tokio::test]
    async fn test_rejects_collection_path() {
        let batcher = Autobatcher::new(Arc::new(RecordingStore::default()));
        let err = batcher
            .enqueue_delete(&DocPath::parse("items").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DocModelError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_flushed_writes_land_in_store() {
        let store = Arc::new(MemoryStore::new());
        let batcher = Autobatcher::with_limit(store.clone(), 2).unwrap();
        batcher.enqueue_set(&doc(0), payload(), false).await.unwrap();
        batcher
            .enqueue_set(&doc(0), json!({"m": 2}).as_object().cloned().unwrap(), true)
            .await
            .unwrap();
        batcher.flush().await.unwrap();

        let stored = store.get(&doc(0)).await.unwrap();
        assert_eq!(stored.fields.unwrap(), json!({"n": 1, "m": 2}).as_object().cloned().unwrap());
        assert_eq!(batcher.commits(), 1);
    }
}
