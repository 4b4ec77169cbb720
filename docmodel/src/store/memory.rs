use super::embedded::{check_precondition, resolve_write, Backend, EmbeddedStore, Precondition, StoredDocument};
use super::{PendingWrite, StoreConfig};
use crate::error::Result;
use crate::path::DocPath;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Documents held in a sorted map keyed by full path.
#[derive(Default)]
pub struct MemoryBackend {
    documents: RwLock<BTreeMap<DocPath, StoredDocument>>,
    version: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    fn read(&self, path: &DocPath) -> Result<Option<StoredDocument>> {
        Ok(self.documents.read().get(path).cloned())
    }

    fn list(&self, collection: &DocPath) -> Result<Vec<(DocPath, StoredDocument)>> {
        // Paths under one collection are contiguous in the map, but nested
        // documents interleave with direct children, so filter by depth.
        Ok(self
            .documents
            .read()
            .range(collection.clone()..)
            .take_while(|(path, _)| path.segments().starts_with(collection.segments()))
            .filter(|(path, _)| path.is_child_of(collection))
            .map(|(path, doc)| (path.clone(), doc.clone()))
            .collect())
    }

    fn apply(&self, writes: &[PendingWrite], preconditions: &[Precondition]) -> Result<Vec<DocPath>> {
        let mut documents = self.documents.write();
        for precondition in preconditions {
            check_precondition(documents.get(&precondition.path), precondition)?;
        }

        // Stage every write first so a failure leaves the map untouched.
        let now = Utc::now();
        let mut staged: BTreeMap<DocPath, Option<StoredDocument>> = BTreeMap::new();
        let mut changed = Vec::new();
        for write in writes {
            let path = write.path();
            let existing = match staged.get(path) {
                Some(doc) => doc.clone(),
                None => documents.get(path).cloned(),
            };
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            let next = resolve_write(existing.as_ref(), write, version, now)?;
            staged.insert(path.clone(), next);
            if !changed.contains(path) {
                changed.push(path.clone());
            }
        }

        for (path, doc) in staged {
            match doc {
                Some(doc) => {
                    documents.insert(path, doc);
                }
                None => {
                    documents.remove(&path);
                }
            }
        }
        Ok(changed)
    }
}

/// Store that keeps everything in process memory.
pub type MemoryStore = EmbeddedStore<MemoryBackend>;

impl EmbeddedStore<MemoryBackend> {
    pub fn new() -> Self {
        EmbeddedStore::assemble(MemoryBackend::new(), StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Result<Self> {
        EmbeddedStore::with_backend(MemoryBackend::new(), config)
    }
}

impl Default for EmbeddedStore<MemoryBackend> {
    fn default() -> Self {
        Self::new()
    }
}
