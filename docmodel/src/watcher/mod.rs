use crate::document::RawDocument;
use crate::error::{DocModelError, Result};
use crate::path::DocPath;
use crate::store::{QueryConstraint, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Read access the hub needs to recompute snapshots after a commit.
pub trait SnapshotSource {
    fn snapshot_document(&self, path: &DocPath) -> Result<RawDocument>;

    fn snapshot_query(
        &self,
        collection: &DocPath,
        constraints: &[QueryConstraint],
    ) -> Result<Vec<RawDocument>>;
}

/// What a watch observes.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchTarget {
    Document(DocPath),
    Query {
        collection: DocPath,
        constraints: Vec<QueryConstraint>,
    },
}

impl WatchTarget {
    fn affected_by(&self, changed: &DocPath) -> bool {
        match self {
            WatchTarget::Document(path) => path == changed,
            WatchTarget::Query { collection, .. } => changed.is_child_of(collection),
        }
    }

    fn snapshot(&self, source: &dyn SnapshotSource) -> Result<Snapshot> {
        match self {
            WatchTarget::Document(path) => source.snapshot_document(path).map(Snapshot::Document),
            WatchTarget::Query {
                collection,
                constraints,
            } => source
                .snapshot_query(collection, constraints)
                .map(Snapshot::Query),
        }
    }
}

/// State of a watch target at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Document(RawDocument),
    Query(Vec<RawDocument>),
}

struct Watch {
    target: WatchTarget,
    /// Last snapshot handed to the delivery task.
    last: Mutex<Option<Snapshot>>,
    sender: mpsc::UnboundedSender<Snapshot>,
}

impl Watch {
    /// Recompute the snapshot and queue it unless it matches the last one.
    /// Runs under `last` so queued snapshots never go backwards.
    fn refresh(&self, source: &dyn SnapshotSource) -> Result<()> {
        let mut last = self.last.lock();
        let snapshot = self.target.snapshot(source)?;
        if last.as_ref() == Some(&snapshot) {
            return Ok(());
        }
        if self.sender.send(snapshot.clone()).is_ok() {
            *last = Some(snapshot);
        }
        Ok(())
    }
}

/// Fans committed changes out to realtime subscriptions.
///
/// Each subscription gets its own delivery task fed through an unbounded
/// channel: callbacks for one subscription run one at a time in commit
/// order, and never after the subscription is cancelled.
#[derive(Default)]
pub struct WatchHub {
    next_id: AtomicU64,
    watches: Mutex<HashMap<u64, Arc<Watch>>>,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Arc::new(WatchHub::default())
    }

    /// Register a watch, queue its initial snapshot and start delivering to
    /// `deliver`. Requires a Tokio runtime.
    pub fn watch<F>(
        self: &Arc<Self>,
        source: &dyn SnapshotSource,
        target: WatchTarget,
        deliver: F,
    ) -> Result<Subscription>
    where
        F: Fn(Snapshot) + Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            DocModelError::Store("realtime subscriptions require a Tokio runtime".into())
        })?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<Snapshot>();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let watch = Arc::new(Watch {
            target,
            last: Mutex::new(None),
            sender,
        });

        self.watches.lock().insert(id, watch.clone());
        if let Err(e) = watch.refresh(source) {
            self.watches.lock().remove(&id);
            return Err(e);
        }
        log::debug!("Watching {:?} (subscription {id})", watch.target);

        let active = Arc::new(AtomicBool::new(true));
        let delivering = active.clone();
        runtime.spawn(async move {
            while let Some(snapshot) = receiver.recv().await {
                if !delivering.load(Ordering::Acquire) {
                    break;
                }
                deliver(snapshot);
            }
        });

        let hub: Weak<WatchHub> = Arc::downgrade(self);
        Ok(Subscription::new(move || {
            active.store(false, Ordering::Release);
            if let Some(hub) = hub.upgrade() {
                hub.watches.lock().remove(&id);
                log::debug!("Cancelled subscription {id}");
            }
        }))
    }

    /// Refresh every watch affected by the changed paths.
    pub fn notify(&self, source: &dyn SnapshotSource, changed: &[DocPath]) {
        if changed.is_empty() {
            return;
        }
        let affected: Vec<Arc<Watch>> = self
            .watches
            .lock()
            .values()
            .filter(|watch| changed.iter().any(|path| watch.target.affected_by(path)))
            .cloned()
            .collect();

        for watch in affected {
            if let Err(e) = watch.refresh(source) {
                log::warn!("Failed to refresh {:?}: {e}", watch.target);
            }
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentRef, Fields};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Snapshot source backed by a plain map.
    #[derive(Default)]
    struct MapSource {
        documents: Mutex<BTreeMap<DocPath, Fields>>,
    }

    impl MapSource {
        fn put(&self, path: &str, value: serde_json::Value) -> DocPath {
            let path = DocPath::parse(path).unwrap();
            self.documents
                .lock()
                .insert(path.clone(), value.as_object().cloned().unwrap());
            path
        }
    }

    impl SnapshotSource for MapSource {
        fn snapshot_document(&self, path: &DocPath) -> Result<RawDocument> {
            Ok(RawDocument {
                reference: DocumentRef::new(path.clone()),
                fields: self.documents.lock().get(path).cloned(),
                create_time: None,
                update_time: None,
            })
        }

        fn snapshot_query(
            &self,
            collection: &DocPath,
            _constraints: &[QueryConstraint],
        ) -> Result<Vec<RawDocument>> {
            Ok(self
                .documents
                .lock()
                .iter()
                .filter(|(path, _)| path.is_child_of(collection))
                .map(|(path, fields)| RawDocument {
                    reference: DocumentRef::new(path.clone()),
                    fields: Some(fields.clone()),
                    create_time: None,
                    update_time: None,
                })
                .collect())
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Snapshot>) -> Snapshot {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("snapshot delivered in time")
            .expect("channel open")
    }

    fn forward(tx: mpsc::UnboundedSender<Snapshot>) -> impl Fn(Snapshot) + Send + Sync {
        move |snapshot| {
            let _ = tx.send(snapshot);
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot_and_change() {
        let hub = WatchHub::new();
        let source = MapSource::default();
        let path = DocPath::parse("profiles/a").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = hub
            .watch(&source, WatchTarget::Document(path.clone()), forward(tx))
            .unwrap();

        match next(&mut rx).await {
            Snapshot::Document(doc) => assert!(!doc.exists()),
            other => panic!("Expected document snapshot, got {other:?}"),
        }

        source.put("profiles/a", json!({"name": "ann"}));
        hub.notify(&source, &[path]);
        match next(&mut rx).await {
            Snapshot::Document(doc) => assert_eq!(doc.fields.unwrap()["name"], json!("ann")),
            other => panic!("Expected document snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_suppressed() {
        let hub = WatchHub::new();
        let source = MapSource::default();
        let collection = DocPath::parse("profiles").unwrap();
        let changed = source.put("profiles/a", json!({"name": "ann"}));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = hub
            .watch(
                &source,
                WatchTarget::Query {
                    collection,
                    constraints: vec![],
                },
                forward(tx),
            )
            .unwrap();
        next(&mut rx).await;

        hub.notify(&source, &[changed]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrelated_change_ignored() {
        let hub = WatchHub::new();
        let source = MapSource::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = hub
            .watch(
                &source,
                WatchTarget::Query {
                    collection: DocPath::parse("profiles").unwrap(),
                    constraints: vec![],
                },
                forward(tx),
            )
            .unwrap();
        next(&mut rx).await;

        let nested = source.put("profiles/a/groups/g1", json!({"name": "x"}));
        hub.notify(&source, &[nested]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_removes_watch() {
        let hub = WatchHub::new();
        let source = MapSource::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = hub
            .watch(
                &source,
                WatchTarget::Document(DocPath::parse("profiles/a").unwrap()),
                forward(tx),
            )
            .unwrap();
        assert_eq!(hub.len(), 1);
        sub.unsubscribe();
        assert!(hub.is_empty());
    }

    #[test]
    fn test_watch_requires_runtime() {
        let hub = WatchHub::new();
        let source = MapSource::default();
        let err = hub
            .watch(
                &source,
                WatchTarget::Document(DocPath::parse("profiles/a").unwrap()),
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, DocModelError::Store(_)));
    }
}
