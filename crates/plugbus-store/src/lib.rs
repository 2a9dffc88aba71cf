pub mod database;
pub mod error;
pub mod plugins;
pub mod schema;
pub mod store;
pub mod whitelist;

pub use database::Database;
pub use error::StoreError;
pub use plugins::{FunctionSpec, PluginManifest, PluginRepo, PluginRow};
pub use store::{PluginStore, SqliteStore};
pub use whitelist::{WhitelistEntry, WhitelistRepo};
