use std::sync::Arc;

use tracing::{debug, error};

use plugbus_core::{PluginKey, Value};
use plugbus_store::{PluginManifest, PluginStore};

use crate::error::DispatchError;

/// Front door for every dispatched message: nothing touches broker state
/// until the gate has said yes.
///
/// A store failure is a denial.
#[derive(Clone)]
pub struct AuthorizationGate {
    store: Arc<dyn PluginStore>,
}

impl AuthorizationGate {
    pub fn new(store: Arc<dyn PluginStore>) -> Self {
        Self { store }
    }

    pub fn verify_identity(&self, key: &PluginKey) -> Result<(), DispatchError> {
        match self.store.verify_key(key) {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(plugin_key = %key.fingerprint(), "unknown key");
                Err(DispatchError::Authorization("unknown plugin key".into()))
            }
            Err(e) => {
                error!(plugin_key = %key.fingerprint(), error = %e, "key verification failed");
                Err(DispatchError::Authorization("key verification unavailable".into()))
            }
        }
    }

    pub fn verify_function(&self, owner: &PluginKey, function: &str, args: &[Value]) -> Result<(), DispatchError> {
        match self.store.verify_function(owner, function, args) {
            Ok(true) => Ok(()),
            Ok(false) => Err(DispatchError::Authorization(format!(
                "function `{function}` is not registered with this signature"
            ))),
            Err(e) => {
                error!(plugin_key = %owner.fingerprint(), function, error = %e, "function verification failed");
                Err(DispatchError::Authorization("function verification unavailable".into()))
            }
        }
    }

    /// Persist a plugin's declared functions. Identity must already be verified.
    pub fn register(&self, key: &PluginKey, manifest: &PluginManifest) -> Result<(), DispatchError> {
        self.store.register_plugin(key, manifest).map_err(|e| {
            error!(plugin_key = %key.fingerprint(), error = %e, "plugin registration failed");
            DispatchError::Internal("registration could not be stored".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugbus_store::{Database, FunctionSpec, SqliteStore, StoreError};
    use plugbus_core::ValueKind;

    struct BrokenStore;

    impl PluginStore for BrokenStore {
        fn verify_key(&self, _: &PluginKey) -> Result<bool, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn verify_function(&self, _: &PluginKey, _: &str, _: &[Value]) -> Result<bool, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn register_plugin(&self, _: &PluginKey, _: &PluginManifest) -> Result<(), StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
    }

    #[test]
    fn store_failure_denies() {
        let gate = AuthorizationGate::new(Arc::new(BrokenStore));
        let key = PluginKey::generate();
        assert!(matches!(gate.verify_identity(&key), Err(DispatchError::Authorization(_))));
        assert!(matches!(
            gate.verify_function(&key, "add", &[]),
            Err(DispatchError::Authorization(_))
        ));
        assert!(matches!(
            gate.register(
                &key,
                &PluginManifest {
                    name: "x".into(),
                    description: String::new(),
                    author: String::new(),
                    license: String::new(),
                    functions: vec![],
                }
            ),
            Err(DispatchError::Internal(_))
        ));
    }

    #[test]
    fn delegates_to_sqlite_store() {
        let store = SqliteStore::new(Database::in_memory().unwrap());
        let key = PluginKey::generate();
        store.whitelist().add(&key, None).unwrap();
        let gate = AuthorizationGate::new(Arc::new(store));

        gate.verify_identity(&key).unwrap();
        assert!(gate.verify_identity(&PluginKey::generate()).is_err());

        gate.register(
            &key,
            &PluginManifest {
                name: "echo".into(),
                description: String::new(),
                author: String::new(),
                license: String::new(),
                functions: vec![FunctionSpec {
                    name: "echo".into(),
                    description: String::new(),
                    args: vec![ValueKind::String],
                }],
            },
        )
        .unwrap();
        gate.verify_function(&key, "echo", &[Value::from("hi")]).unwrap();
        assert!(gate.verify_function(&key, "echo", &[Value::from(1u64)]).is_err());
    }
}
