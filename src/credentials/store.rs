//! Persistent credential storage.
//!
//! One row per user. Rows only ever hold [`SealedCredential`]s; the store has
//! no access to the cipher.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::SealedCredential;
use crate::error::StoreError;

/// Keyed storage of one sealed credential per user.
///
/// # Atomicity
/// `upsert` replaces the whole row or nothing: a failed write leaves the
/// previous record intact, and concurrent writers never produce a row that
/// mixes fields from different writes.
pub trait CredentialStore: Send + Sync {
    /// Load the record for `user_id`, `None` if absent
    fn get(&self, user_id: &str) -> Result<Option<SealedCredential>, StoreError>;

    /// Insert or replace the record for `record.user_id`.
    ///
    /// Records with an empty token field are rejected as `Corrupt`.
    fn upsert(&self, record: &SealedCredential) -> Result<(), StoreError>;

    /// Replace the record only if its `updated_at` still equals `expected`.
    ///
    /// Returns `false`, writing nothing, when the row changed or vanished
    /// since it was read.
    fn upsert_if_unchanged(
        &self,
        record: &SealedCredential,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Remove the record for `user_id`. Only used for explicit revocation.
    fn delete(&self, user_id: &str) -> Result<bool, StoreError>;

    /// All users with a stored record
    fn list_users(&self) -> Result<Vec<String>, StoreError>;
}

/// SQLite-backed credential store.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     user_id TEXT PRIMARY KEY,
///     access_token TEXT NOT NULL,   -- sealed
///     refresh_token TEXT NOT NULL,  -- sealed
///     scopes TEXT NOT NULL,         -- space separated
///     expires_at TEXT NOT NULL,     -- RFC 3339
///     created_at TEXT NOT NULL,     -- RFC 3339
///     updated_at TEXT NOT NULL      -- RFC 3339
/// );
/// ```
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Creates or opens a credential store at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory database, for tests and throwaway runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                scopes TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Database {
            message: "connection lock poisoned".to_string(),
        })
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self, user_id: &str) -> Result<Option<SealedCredential>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT access_token, refresh_token, scopes, expires_at, updated_at
                FROM credentials
                WHERE user_id = ?1
                "#,
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((access_token, refresh_token, scopes, expires_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(SealedCredential {
            user_id: user_id.to_string(),
            access_token,
            refresh_token,
            scopes: scopes.split_whitespace().map(str::to_string).collect(),
            expires_at: parse_timestamp("expires_at", &expires_at)?,
            updated_at: parse_timestamp("updated_at", &updated_at)?,
        }))
    }

    fn upsert(&self, record: &SealedCredential) -> Result<(), StoreError> {
        ensure_complete(record)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO credentials (
                user_id, access_token, refresh_token, scopes,
                expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                scopes = excluded.scopes,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                record.user_id,
                record.access_token,
                record.refresh_token,
                record.scopes.join(" "),
                record.expires_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn upsert_if_unchanged(
        &self,
        record: &SealedCredential,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        ensure_complete(record)?;
        let conn = self.lock()?;

        let rows_affected = conn.execute(
            r#"
            UPDATE credentials SET
                access_token = ?2,
                refresh_token = ?3,
                scopes = ?4,
                expires_at = ?5,
                updated_at = ?6
            WHERE user_id = ?1 AND updated_at = ?7
            "#,
            params![
                record.user_id,
                record.access_token,
                record.refresh_token,
                record.scopes.join(" "),
                record.expires_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
                expected.to_rfc3339(),
            ],
        )?;

        Ok(rows_affected == 1)
    }

    fn delete(&self, user_id: &str) -> Result<bool, StoreError> {
        let rows_affected = self
            .lock()?
            .execute("DELETE FROM credentials WHERE user_id = ?1", params![user_id])?;

        Ok(rows_affected > 0)
    }

    fn list_users(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT user_id FROM credentials ORDER BY user_id")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(users)
    }
}

/// A sealed token is never empty; an empty one could not be opened again.
pub(crate) fn ensure_complete(record: &SealedCredential) -> Result<(), StoreError> {
    if record.access_token.is_empty() || record.refresh_token.is_empty() {
        return Err(StoreError::Corrupt {
            message: "empty token field".to_string(),
        });
    }
    Ok(())
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            message: format!("unparseable {}", field),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::{sample_credential, test_cipher};
    use chrono::Duration;
    use std::sync::Arc;

    fn sealed(user_id: &str) -> SealedCredential {
        sample_credential(user_id).seal(&test_cipher()).unwrap()
    }

    #[test]
    fn test_upsert_and_get() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        let record = sealed("user1");

        store.upsert(&record).unwrap();

        let loaded = store.get("user1").unwrap().expect("record missing");
        assert_eq!(loaded.access_token, record.access_token);
        assert_eq!(loaded.refresh_token, record.refresh_token);
        assert_eq!(loaded.scopes, vec!["openid".to_string()]);
        assert_eq!(loaded.expires_at.timestamp(), record.expires_at.timestamp());
    }

    #[test]
    fn test_get_nonexistent() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        assert!(store.get("nobody").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_whole_row() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.upsert(&sealed("user1")).unwrap();

        let mut second = sealed("user1");
        second.expires_at = Utc::now() + Duration::hours(2);
        second.scopes = vec!["openid".to_string(), "https://mail.google.com/".to_string()];
        store.upsert(&second).unwrap();

        let loaded = store.get("user1").unwrap().unwrap();
        assert_eq!(loaded.access_token, second.access_token);
        assert_eq!(loaded.refresh_token, second.refresh_token);
        assert_eq!(loaded.scopes.len(), 2);
        assert_eq!(store.list_users().unwrap(), vec!["user1".to_string()]);
    }

    #[test]
    fn test_empty_refresh_token_rejected() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        let first = sealed("user1");
        store.upsert(&first).unwrap();

        let mut second = sealed("user1");
        second.refresh_token = String::new();
        assert!(matches!(store.upsert(&second), Err(StoreError::Corrupt { .. })));

        let mut fresh = sealed("user2");
        fresh.refresh_token = String::new();
        assert!(matches!(store.upsert(&fresh), Err(StoreError::Corrupt { .. })));

        let loaded = store.get("user1").unwrap().unwrap();
        assert_eq!(loaded.refresh_token, first.refresh_token);
        assert!(store.get("user2").unwrap().is_none());
    }

    #[test]
    fn test_upsert_if_unchanged() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        let first = sealed("user1");
        store.upsert(&first).unwrap();
        let read_at = store.get("user1").unwrap().unwrap().updated_at;

        // Someone else writes in between.
        let mut other = sealed("user1");
        other.updated_at = read_at + Duration::seconds(5);
        store.upsert(&other).unwrap();

        let mut stale = sealed("user1");
        stale.updated_at = read_at + Duration::seconds(10);
        assert!(!store.upsert_if_unchanged(&stale, read_at).unwrap());
        assert_eq!(
            store.get("user1").unwrap().unwrap().access_token,
            other.access_token
        );

        let current = store.get("user1").unwrap().unwrap().updated_at;
        assert!(store.upsert_if_unchanged(&stale, current).unwrap());
        assert_eq!(
            store.get("user1").unwrap().unwrap().access_token,
            stale.access_token
        );

        // A vanished row is not recreated.
        store.delete("user1").unwrap();
        assert!(!store.upsert_if_unchanged(&stale, stale.updated_at).unwrap());
        assert!(store.get("user1").unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.upsert(&sealed("user1")).unwrap();

        assert!(store.delete("user1").unwrap());
        assert!(store.get("user1").unwrap().is_none());
        assert!(!store.delete("user1").unwrap());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");
        let record = sealed("user1");

        {
            let store = SqliteCredentialStore::open(&path).unwrap();
            store.upsert(&record).unwrap();
        }

        let store = SqliteCredentialStore::open(&path).unwrap();
        let loaded = store.get("user1").unwrap().unwrap();
        assert_eq!(loaded.access_token, record.access_token);
    }

    #[test]
    fn test_concurrent_writers_never_mix_fields() {
        let store = Arc::new(SqliteCredentialStore::open_in_memory().unwrap());
        let cipher = test_cipher();

        // Each writer's access token encodes its own expiry, so a torn row
        // would show up as a mismatch.
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let cipher = cipher.clone();
                std::thread::spawn(move || {
                    for round in 0..20 {
                        let mut credential = sample_credential("user1");
                        let secs = i64::from(i * 100 + round);
                        credential.expires_at =
                            DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap();
                        credential.access_token = format!("token-{}", secs);
                        store.upsert(&credential.seal(&cipher).unwrap()).unwrap();
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }

        let loaded = store.get("user1").unwrap().unwrap().open(&cipher).unwrap();
        let secs = loaded.expires_at.timestamp() - 1_700_000_000;
        assert_eq!(loaded.access_token, format!("token-{}", secs));
    }
}
