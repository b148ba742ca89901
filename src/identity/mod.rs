// =====================================================
// IDENTITY MAPPING CACHE
// Memoized old-key -> new-identity assignments
// =====================================================

mod storage;

pub use storage::IdentityStore;

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub table: String,
    pub old_id: String,
}

impl IdentityKey {
    pub fn new(table: &str, old_id: &str) -> Self {
        Self {
            table: table.trim().to_string(),
            old_id: old_id.trim().to_string(),
        }
    }
}

/// At most one identity is ever generated per `(table, old_id)`.
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: RwLock<HashMap<IdentityKey, String>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, table: &str, old_id: &str) -> Result<Option<String>, String> {
        let key = IdentityKey::new(table, old_id);
        let guard = self
            .entries
            .read()
            .map_err(|_| "Identity cache lock is poisoned".to_string())?;
        Ok(guard.get(&key).cloned())
    }

    /// Returns the identity for the pair, generating and storing one on first sight.
    pub fn remap(&self, table: &str, old_id: &str) -> Result<String, String> {
        if table.trim().is_empty() {
            return Err("Identity remap requires a table name".to_string());
        }
        if let Some(existing) = self.lookup(table, old_id)? {
            return Ok(existing);
        }

        let key = IdentityKey::new(table, old_id);
        let mut guard = self
            .entries
            .write()
            .map_err(|_| "Identity cache lock is poisoned".to_string())?;
        // Another writer may have won the race between the two locks.
        let identity = guard
            .entry(key)
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        Ok(identity)
    }

    /// Inserts pairs that are not yet known; existing assignments win.
    pub fn seed<I>(&self, pairs: I) -> Result<usize, String>
    where
        I: IntoIterator<Item = (IdentityKey, String)>,
    {
        let mut guard = self
            .entries
            .write()
            .map_err(|_| "Identity cache lock is poisoned".to_string())?;
        let mut inserted = 0usize;
        for (key, identity) in pairs {
            if !guard.contains_key(&key) {
                guard.insert(key, identity);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn snapshot(&self) -> Result<Vec<(IdentityKey, String)>, String> {
        let guard = self
            .entries
            .read()
            .map_err(|_| "Identity cache lock is poisoned".to_string())?;
        let mut pairs = guard
            .iter()
            .map(|(key, identity)| (key.clone(), identity.clone()))
            .collect::<Vec<_>>();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(pairs)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
