/// SQL DDL for the plugin registry database.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS whitelist (
    key BLOB PRIMARY KEY,
    label TEXT,
    added_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS plugins (
    key BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    author TEXT NOT NULL,
    license TEXT NOT NULL,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS functions (
    plugin_key BLOB NOT NULL REFERENCES plugins(key) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    args TEXT NOT NULL,
    PRIMARY KEY (plugin_key, name)
);

CREATE INDEX IF NOT EXISTS idx_plugins_name ON plugins(name);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
