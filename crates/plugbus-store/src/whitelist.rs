use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::instrument;

use plugbus_core::PluginKey;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize)]
pub struct WhitelistEntry {
    #[serde(serialize_with = "serialize_key")]
    pub key: PluginKey,
    pub label: Option<String>,
    pub added_at: String,
}

fn serialize_key<S: serde::Serializer>(key: &PluginKey, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&key.to_base64())
}

pub(crate) fn key_from_blob(blob: &[u8], table: &'static str) -> Result<PluginKey, StoreError> {
    PluginKey::from_slice(blob).map_err(|e| StoreError::CorruptRow {
        table,
        column: "key",
        detail: e.to_string(),
    })
}

/// Keys allowed to connect to the broker.
#[derive(Clone)]
pub struct WhitelistRepo {
    db: Database,
}

impl WhitelistRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add a key. Returns false if it was already present.
    #[instrument(skip(self), fields(plugin_key = %key.fingerprint()))]
    pub fn add(&self, key: &PluginKey, label: Option<&str>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO whitelist (key, label, added_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![&key.as_bytes()[..], label, Utc::now().to_rfc3339()],
            )?;
            Ok(inserted == 1)
        })
    }

    /// Remove a key. Returns false if it was not present.
    #[instrument(skip(self), fields(plugin_key = %key.fingerprint()))]
    pub fn remove(&self, key: &PluginKey) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM whitelist WHERE key = ?1", [&key.as_bytes()[..]])?;
            Ok(removed == 1)
        })
    }

    pub fn contains(&self, key: &PluginKey) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM whitelist WHERE key = ?1",
                    [&key.as_bytes()[..]],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<WhitelistEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, label, added_at FROM whitelist ORDER BY added_at, rowid")?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(blob, label, added_at)| {
                    Ok(WhitelistEntry {
                        key: key_from_blob(&blob, "whitelist")?,
                        label,
                        added_at,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> WhitelistRepo {
        WhitelistRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn add_and_contains() {
        let repo = repo();
        let key = PluginKey::generate();
        assert!(!repo.contains(&key).unwrap());
        assert!(repo.add(&key, Some("calc")).unwrap());
        assert!(repo.contains(&key).unwrap());
    }

    #[test]
    fn add_twice_is_noop() {
        let repo = repo();
        let key = PluginKey::generate();
        assert!(repo.add(&key, None).unwrap());
        assert!(!repo.add(&key, None).unwrap());
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let repo = repo();
        let key = PluginKey::generate();
        assert!(!repo.remove(&key).unwrap());
        repo.add(&key, None).unwrap();
        assert!(repo.remove(&key).unwrap());
        assert!(!repo.contains(&key).unwrap());
    }

    #[test]
    fn list_in_insertion_order() {
        let repo = repo();
        let a = PluginKey::generate();
        let b = PluginKey::generate();
        repo.add(&a, Some("a")).unwrap();
        repo.add(&b, Some("b")).unwrap();
        let entries = repo.list().unwrap();
        assert_eq!(entries[0].key, a);
        assert_eq!(entries[1].label.as_deref(), Some("b"));
    }

    #[test]
    fn entry_serializes_key_as_base64() {
        let key = PluginKey::from_bytes([3u8; 32]);
        let entry = WhitelistEntry {
            key,
            label: None,
            added_at: "now".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["key"], key.to_base64());
    }
}
