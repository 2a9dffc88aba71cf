use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use plugbus_core::{PluginKey, Value, ValueKind};

use crate::database::Database;
use crate::error::StoreError;
use crate::whitelist::key_from_blob;

/// A function a plugin exposes. `args` holds the expected kind of each
/// positional argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub args: Vec<ValueKind>,
}

impl FunctionSpec {
    /// True when `args` has the declared arity and every argument matches
    /// its declared kind.
    pub fn accepts(&self, args: &[Value]) -> bool {
        self.args.len() == args.len()
            && self
                .args
                .iter()
                .zip(args)
                .all(|(declared, actual)| declared.accepts(actual.kind()))
    }
}

/// Everything a plugin declares in its `register` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub description: String,
    pub author: String,
    pub license: String,
    pub functions: Vec<FunctionSpec>,
}

#[derive(Clone, Debug)]
pub struct PluginRow {
    pub key: PluginKey,
    pub name: String,
    pub description: String,
    pub author: String,
    pub license: String,
    pub registered_at: String,
}

#[derive(Clone)]
pub struct PluginRepo {
    db: Database,
}

impl PluginRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store the plugin's metadata and replace its function set.
    #[instrument(skip(self, manifest), fields(plugin_key = %key.fingerprint(), name = %manifest.name))]
    pub fn register(&self, key: &PluginKey, manifest: &PluginManifest) -> Result<(), StoreError> {
        let blob = &key.as_bytes()[..];
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO plugins (key, name, description, author, license, registered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    author = excluded.author,
                    license = excluded.license,
                    registered_at = excluded.registered_at",
                rusqlite::params![
                    blob,
                    manifest.name,
                    manifest.description,
                    manifest.author,
                    manifest.license,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            tx.execute("DELETE FROM functions WHERE plugin_key = ?1", [blob])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO functions (plugin_key, name, description, args)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for func in &manifest.functions {
                    let args = serde_json::to_string(&func.args)?;
                    stmt.execute(rusqlite::params![blob, func.name, func.description, args])?;
                }
            }
            tx.commit()?;
            debug!(functions = manifest.functions.len(), "plugin registered");
            Ok(())
        })
    }

    pub fn get(&self, key: &PluginKey) -> Result<PluginRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT name, description, author, license, registered_at
                 FROM plugins WHERE key = ?1",
                [&key.as_bytes()[..]],
                |row| {
                    Ok(PluginRow {
                        key: *key,
                        name: row.get(0)?,
                        description: row.get(1)?,
                        author: row.get(2)?,
                        license: row.get(3)?,
                        registered_at: row.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("plugin {}", key.fingerprint())))
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<PluginRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, name, description, author, license, registered_at
                 FROM plugins ORDER BY name",
            )?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(blob, name, description, author, license, registered_at)| {
                    Ok(PluginRow {
                        key: key_from_blob(&blob, "plugins")?,
                        name,
                        description,
                        author,
                        license,
                        registered_at,
                    })
                })
                .collect()
        })
    }

    pub fn functions(&self, key: &PluginKey) -> Result<Vec<FunctionSpec>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, description, args FROM functions WHERE plugin_key = ?1 ORDER BY name",
            )?;
            let raw = stmt
                .query_map([&key.as_bytes()[..]], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(name, description, args)| {
                    Ok(FunctionSpec {
                        name,
                        description,
                        args: parse_args(&args)?,
                    })
                })
                .collect()
        })
    }

    pub fn function(&self, key: &PluginKey, name: &str) -> Result<Option<FunctionSpec>, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT description, args FROM functions WHERE plugin_key = ?1 AND name = ?2",
                    rusqlite::params![&key.as_bytes()[..], name],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            found
                .map(|(description, args)| {
                    Ok(FunctionSpec {
                        name: name.to_owned(),
                        description,
                        args: parse_args(&args)?,
                    })
                })
                .transpose()
        })
    }
}

fn parse_args(raw: &str) -> Result<Vec<ValueKind>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table: "functions",
        column: "args",
        detail: format!("invalid JSON: {e}"),
    })
}
