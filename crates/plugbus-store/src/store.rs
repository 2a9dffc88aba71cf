//! Verification interface consumed by the broker's authorization gate.

use tracing::debug;

use plugbus_core::{PluginKey, Value};

use crate::database::Database;
use crate::error::StoreError;
use crate::plugins::{PluginManifest, PluginRepo};
use crate::whitelist::WhitelistRepo;

/// Durable registry of plugin identities and their functions.
///
/// Calls are synchronous and expected to finish within a single dispatch
/// turn.
pub trait PluginStore: Send + Sync {
    /// Whether the key may talk to the broker at all.
    fn verify_key(&self, key: &PluginKey) -> Result<bool, StoreError>;

    /// Whether `owner` exposes `function` and `args` matches its declared
    /// arity and argument kinds.
    fn verify_function(
        &self,
        owner: &PluginKey,
        function: &str,
        args: &[Value],
    ) -> Result<bool, StoreError>;

    fn register_plugin(&self, key: &PluginKey, manifest: &PluginManifest) -> Result<(), StoreError>;
}

/// SQLite-backed [`PluginStore`].
#[derive(Clone)]
pub struct SqliteStore {
    whitelist: WhitelistRepo,
    plugins: PluginRepo,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            whitelist: WhitelistRepo::new(db.clone()),
            plugins: PluginRepo::new(db),
        }
    }

    pub fn whitelist(&self) -> &WhitelistRepo {
        &self.whitelist
    }

    pub fn plugins(&self) -> &PluginRepo {
        &self.plugins
    }
}

impl PluginStore for SqliteStore {
    fn verify_key(&self, key: &PluginKey) -> Result<bool, StoreError> {
        self.whitelist.contains(key)
    }

    fn verify_function(
        &self,
        owner: &PluginKey,
        function: &str,
        args: &[Value],
    ) -> Result<bool, StoreError> {
        let Some(spec) = self.plugins.function(owner, function)? else {
            debug!(plugin_key = %owner.fingerprint(), function, "function not registered");
            return Ok(false);
        };
        Ok(spec.accepts(args))
    }

    fn register_plugin(&self, key: &PluginKey, manifest: &PluginManifest) -> Result<(), StoreError> {
        self.plugins.register(key, manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::FunctionSpec;
    use plugbus_core::ValueKind;

    fn store() -> SqliteStore {
        SqliteStore::new(Database::in_memory().unwrap())
    }

    #[test]
    fn verify_key_follows_whitelist() {
        let store = store();
        let key = PluginKey::generate();
        assert!(!store.verify_key(&key).unwrap());
        store.whitelist().add(&key, None).unwrap();
        assert!(store.verify_key(&key).unwrap());
    }

    #[test]
    fn verify_function_checks_arity_and_kinds() {
        let store = store();
        let key = PluginKey::generate();
        store
            .register_plugin(
                &key,
                &PluginManifest {
                    name: "calc".into(),
                    description: String::new(),
                    author: String::new(),
                    license: String::new(),
                    functions: vec![FunctionSpec {
                        name: "add".into(),
                        description: String::new(),
                        args: vec![ValueKind::Integer, ValueKind::Integer],
                    }],
                },
            )
            .unwrap();

        let two_three = [Value::from(2u64), Value::from(3u64)];
        assert!(store.verify_function(&key, "add", &two_three).unwrap());
        assert!(!store.verify_function(&key, "add", &two_three[..1]).unwrap());
        assert!(!store.verify_function(&key, "sub", &two_three).unwrap());
        assert!(!store
            .verify_function(&PluginKey::generate(), "add", &two_three)
            .unwrap());
    }

    #[test]
    fn usable_as_trait_object() {
        let store: std::sync::Arc<dyn PluginStore> = std::sync::Arc::new(store());
        assert!(!store.verify_key(&PluginKey::generate()).unwrap());
    }
}
