use crate::batch::Autobatcher;
use crate::error::{DocModelError, Result};
use crate::store::Transaction;
use std::fmt;

/// Options for `write_to_new_doc` / `write_to_id`.
#[derive(Clone, Copy, Default)]
pub struct WriteOptions<'a> {
    /// Fill properties absent from the payload with the declared defaults.
    pub merge_defaults: bool,
    /// Merge into the stored document instead of replacing it.
    pub merge_existing: bool,
    /// Queue the write instead of committing it.
    pub autobatcher: Option<&'a Autobatcher>,
    /// Buffer the write in a transaction the caller commits.
    pub transaction: Option<&'a dyn Transaction>,
}

impl<'a> WriteOptions<'a> {
    pub fn new() -> Self {
        WriteOptions::default()
    }

    pub fn merge_defaults(mut self) -> Self {
        self.merge_defaults = true;
        self
    }

    pub fn merge_existing(mut self) -> Self {
        self.merge_existing = true;
        self
    }

    pub fn with_autobatcher(mut self, autobatcher: &'a Autobatcher) -> Self {
        self.autobatcher = Some(autobatcher);
        self
    }

    pub fn in_transaction(mut self, transaction: &'a dyn Transaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_routing(self.autobatcher.is_some(), self.transaction.is_some())
    }
}

impl fmt::Debug for WriteOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOptions")
            .field("merge_defaults", &self.merge_defaults)
            .field("merge_existing", &self.merge_existing)
            .field("autobatcher", &self.autobatcher.is_some())
            .field("transaction", &self.transaction.is_some())
            .finish()
    }
}

/// Options for `get_by_id`.
#[derive(Clone, Copy, Default)]
pub struct ReadOptions<'a> {
    pub transaction: Option<&'a dyn Transaction>,
}

impl<'a> ReadOptions<'a> {
    pub fn new() -> Self {
        ReadOptions::default()
    }

    pub fn in_transaction(mut self, transaction: &'a dyn Transaction) -> Self {
        self.transaction = Some(transaction);
        self
    }
}

impl fmt::Debug for ReadOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("transaction", &self.transaction.is_some())
            .finish()
    }
}

/// Options for `delete_by_id`.
#[derive(Clone, Copy, Default)]
pub struct DeleteOptions<'a> {
    pub autobatcher: Option<&'a Autobatcher>,
    pub transaction: Option<&'a dyn Transaction>,
}

impl<'a> DeleteOptions<'a> {
    pub fn new() -> Self {
        DeleteOptions::default()
    }

    pub fn with_autobatcher(mut self, autobatcher: &'a Autobatcher) -> Self {
        self.autobatcher = Some(autobatcher);
        self
    }

    pub fn in_transaction(mut self, transaction: &'a dyn Transaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_routing(self.autobatcher.is_some(), self.transaction.is_some())
    }
}

impl fmt::Debug for DeleteOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteOptions")
            .field("autobatcher", &self.autobatcher.is_some())
            .field("transaction", &self.transaction.is_some())
            .finish()
    }
}

fn check_routing(batched: bool, transactional: bool) -> Result<()> {
    if batched && transactional {
        return Err(DocModelError::InvalidOptions(
            "a write goes through either an autobatcher or a transaction, not both".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_batched_and_transactional_is_invalid() {
        let store = Arc::new(MemoryStore::new());
        let batcher = Autobatcher::new(store.clone());
        let tx = crate::store::DocumentStore::begin_transaction(store.as_ref())
            .await
            .unwrap();

        let options = WriteOptions::new()
            .with_autobatcher(&batcher)
            .in_transaction(tx.as_ref());
        assert!(matches!(options.validate(), Err(DocModelError::InvalidOptions(_))));

        assert!(WriteOptions::new().merge_defaults().validate().is_ok());
        assert!(DeleteOptions::new().with_autobatcher(&batcher).validate().is_ok());
    }
}
