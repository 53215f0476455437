//! In-memory ledger store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{LedgerError, LedgerKey, LedgerStore};

/// Ledger store held in memory. Clones share the same records.
#[derive(Clone, Debug, Default)]
pub struct MemoryLedgerStore {
    records: Arc<Mutex<BTreeMap<LedgerKey, Vec<String>>>>,
}

impl MemoryLedgerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no key holds an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(Vec::is_empty)
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn read(&self, key: LedgerKey) -> Result<Vec<String>, LedgerError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&key).cloned().unwrap_or_default())
    }

    fn append(&self, key: LedgerKey, entry: &str) -> Result<(), LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.entry(key).or_default().push(entry.to_owned());
        Ok(())
    }

    fn remove(&self, key: LedgerKey) -> Result<(), LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(&key);
        Ok(())
    }
}
