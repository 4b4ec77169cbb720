// The document-store transport consumed by models

mod embedded;
mod memory;
mod query;
mod sqlite;

pub use embedded::{
    check_precondition, resolve_write, Backend, EmbeddedStore, Precondition, StoredDocument,
};
pub use memory::{MemoryBackend, MemoryStore};
pub use query::{apply_constraints, Direction, FilterOp, QueryConstraint};
pub use sqlite::{SqliteBackend, SqliteStore};

use crate::document::{Fields, RawDocument};
use crate::error::{DocModelError, Result};
use crate::path::DocPath;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Maximum number of operations a single physical batch may carry.
pub const MAX_BATCH_SIZE: usize = 500;

/// How a set operation treats an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail if the document already exists.
    Create,
    /// Replace the document, dropping fields absent from the payload.
    Overwrite,
    /// Merge the payload into the document, keeping untouched fields.
    Merge,
}

/// One queued write operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Set {
        path: DocPath,
        fields: Fields,
        mode: WriteMode,
        /// Filled in by the store for properties the resulting document
        /// still lacks, so they rank below both the payload and stored
        /// values.
        defaults: Fields,
    },
    Delete {
        path: DocPath,
    },
}

impl PendingWrite {
    pub fn set(path: DocPath, fields: Fields, mode: WriteMode) -> Self {
        PendingWrite::Set {
            path,
            fields,
            mode,
            defaults: Fields::new(),
        }
    }

    /// Attach store-side defaults to a set. No effect on a delete.
    pub fn with_defaults(mut self, values: Fields) -> Self {
        if let PendingWrite::Set { defaults, .. } = &mut self {
            *defaults = values;
        }
        self
    }

    pub fn path(&self) -> &DocPath {
        match self {
            PendingWrite::Set { path, .. } | PendingWrite::Delete { path } => path,
        }
    }
}

/// Callback for single-document subscriptions.
pub type DocumentCallback = Arc<dyn Fn(RawDocument) + Send + Sync>;

/// Callback for query subscriptions; receives the full result set each time.
pub type QueryCallback = Arc<dyn Fn(Vec<RawDocument>) + Send + Sync>;

/// Live realtime subscription. Unsubscribes when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Hierarchical document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Generate an identifier for a new document.
    fn new_document_id(&self) -> String;

    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    async fn get(&self, path: &DocPath) -> Result<RawDocument>;

    async fn set(&self, path: &DocPath, fields: Fields, mode: WriteMode) -> Result<()> {
        self.commit_batch(vec![PendingWrite::set(path.clone(), fields, mode)])
            .await
    }

    async fn delete(&self, path: &DocPath) -> Result<()> {
        self.commit_batch(vec![PendingWrite::Delete { path: path.clone() }])
            .await
    }

    /// Documents directly inside `collection` that satisfy `constraints`.
    async fn query(
        &self,
        collection: &DocPath,
        constraints: &[QueryConstraint],
    ) -> Result<Vec<RawDocument>>;

    /// Commit writes atomically, in order. Fails with
    /// [`DocModelError::BatchTooLarge`] above [`DocumentStore::max_batch_size`].
    async fn commit_batch(&self, writes: Vec<PendingWrite>) -> Result<()>;

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Watch one document. The callback receives the current state right
    /// away and again after every change.
    fn subscribe_document(&self, path: &DocPath, callback: DocumentCallback)
        -> Result<Subscription>;

    /// Watch a query result set. The callback receives the full result set
    /// right away and again whenever it changes.
    fn subscribe_query(
        &self,
        collection: &DocPath,
        constraints: &[QueryConstraint],
        callback: QueryCallback,
    ) -> Result<Subscription>;
}

/// An atomic unit of reads followed by writes, committed by its owner.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<RawDocument>;

    /// Buffer a write until [`commit`](Transaction::commit).
    fn write(&self, write: PendingWrite) -> Result<()>;

    fn set(&self, path: &DocPath, fields: Fields, mode: WriteMode) -> Result<()> {
        self.write(PendingWrite::set(path.clone(), fields, mode))
    }

    fn delete(&self, path: &DocPath) -> Result<()> {
        self.write(PendingWrite::Delete { path: path.clone() })
    }

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Strategy for store-generated document identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    /// 20 alphanumeric characters.
    #[default]
    Nanoid,
    Ulid,
    Uuid,
}

const AUTO_ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H',
    'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

impl AutoIdStrategy {
    pub fn generate(&self) -> String {
        match self {
            AutoIdStrategy::Nanoid => nanoid::nanoid!(20, &AUTO_ID_ALPHABET),
            AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Settings for the embedded stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub auto_id: AutoIdStrategy,
    pub max_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            auto_id: AutoIdStrategy::default(),
            max_batch_size: MAX_BATCH_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(DocModelError::Configuration(
                "max_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
