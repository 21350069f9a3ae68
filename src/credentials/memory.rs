//! In-memory credential store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::store::{ensure_complete, CredentialStore};
use super::SealedCredential;
use crate::error::StoreError;

/// Credential store backed by a `HashMap`.
///
/// Whole records are swapped under one lock, which gives the same
/// per-user atomicity as the SQLite store. Data is lost on exit.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    records: Arc<Mutex<HashMap<String, SealedCredential>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, SealedCredential>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, user_id: &str) -> Result<Option<SealedCredential>, StoreError> {
        Ok(self.records().get(user_id).cloned())
    }

    fn upsert(&self, record: &SealedCredential) -> Result<(), StoreError> {
        ensure_complete(record)?;
        self.records().insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    fn upsert_if_unchanged(
        &self,
        record: &SealedCredential,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        ensure_complete(record)?;
        let mut records = self.records();

        match records.get_mut(&record.user_id) {
            Some(current) if current.updated_at == expected => {
                *current = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.records().remove(user_id).is_some())
    }

    fn list_users(&self) -> Result<Vec<String>, StoreError> {
        let mut users: Vec<String> = self.records().keys().cloned().collect();
        users.sort();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::{sample_credential, test_cipher};

    #[test]
    fn test_upsert_get_delete() {
        let store = MemoryCredentialStore::new();
        let record = sample_credential("user1").seal(&test_cipher()).unwrap();

        store.upsert(&record).unwrap();
        assert_eq!(store.get("user1").unwrap(), Some(record));
        assert_eq!(store.list_users().unwrap(), vec!["user1".to_string()]);

        assert!(store.delete("user1").unwrap());
        assert!(store.get("user1").unwrap().is_none());
    }

    #[test]
    fn test_empty_refresh_token_rejected() {
        let store = MemoryCredentialStore::new();
        let mut record = sample_credential("user1").seal(&test_cipher()).unwrap();
        record.refresh_token.clear();

        assert!(matches!(store.upsert(&record), Err(StoreError::Corrupt { .. })));
        assert!(store.get("user1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_if_unchanged_detects_newer_write() {
        let store = MemoryCredentialStore::new();
        let first = sample_credential("user1").seal(&test_cipher()).unwrap();
        store.upsert(&first).unwrap();

        let mut newer = sample_credential("user1").seal(&test_cipher()).unwrap();
        newer.updated_at = first.updated_at + chrono::Duration::seconds(1);
        store.upsert(&newer).unwrap();

        let mut stale = sample_credential("user1").seal(&test_cipher()).unwrap();
        stale.updated_at = first.updated_at + chrono::Duration::seconds(2);
        assert!(!store.upsert_if_unchanged(&stale, first.updated_at).unwrap());
        assert_eq!(store.get("user1").unwrap(), Some(newer.clone()));

        assert!(store.upsert_if_unchanged(&stale, newer.updated_at).unwrap());
        assert_eq!(store.get("user1").unwrap(), Some(stale));
    }
}
