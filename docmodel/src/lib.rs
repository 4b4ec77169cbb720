pub mod batch;
pub mod document;
pub mod error;
pub mod listener;
pub mod model;
pub mod path;
pub mod sanitizer;
pub mod schema;
pub mod store;
pub mod watcher;

pub use batch::Autobatcher;
pub use document::{DocumentRef, Fields, RawDocument, SanitizedDocument};
pub use error::{DocModelError, Result};
pub use listener::{ListenerGuard, ListenerRegistry, ListenerState, WatchedListener};
pub use model::{
    Database, DeleteOptions, DocumentCollectionOperations, Model, ReadOptions, Submodel,
    SubmodelInstance, WriteOptions,
};
pub use path::DocPath;
pub use sanitizer::Sanitizer;
pub use schema::{ModelDeclaration, SchemaDefinition, SchemaId, SchemaRegistry};
pub use store::{
    DocumentStore, MemoryStore, QueryConstraint, SqliteStore, StoreConfig, Subscription,
    Transaction, WriteMode,
};
