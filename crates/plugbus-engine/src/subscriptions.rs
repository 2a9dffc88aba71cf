use std::collections::{HashMap, HashSet};

use plugbus_core::PluginKey;

/// Event name to subscriber keys, with a reverse index so a disconnecting
/// plugin can be purged without scanning every event.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_event: HashMap<String, HashSet<PluginKey>>,
    by_key: HashMap<PluginKey, HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the subscription already existed.
    pub fn subscribe(&mut self, event: &str, key: PluginKey) -> bool {
        let added = self.by_event.entry(event.to_owned()).or_default().insert(key);
        if added {
            self.by_key.entry(key).or_default().insert(event.to_owned());
        }
        added
    }

    /// Returns false if there was nothing to remove.
    pub fn unsubscribe(&mut self, event: &str, key: &PluginKey) -> bool {
        let removed = match self.by_event.get_mut(event) {
            Some(keys) => {
                let removed = keys.remove(key);
                if keys.is_empty() {
                    self.by_event.remove(event);
                }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(events) = self.by_key.get_mut(key) {
                events.remove(event);
                if events.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        removed
    }

    pub fn subscribers(&self, event: &str) -> Vec<PluginKey> {
        self.by_event
            .get(event)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every subscription held by `key`. Returns how many were removed.
    pub fn remove_key(&mut self, key: &PluginKey) -> usize {
        let Some(events) = self.by_key.remove(key) else {
            return 0;
        };
        for event in &events {
            if let Some(keys) = self.by_event.get_mut(event) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_event.remove(event);
                }
            }
        }
        events.len()
    }

    #[cfg(test)]
    pub(crate) fn is_subscribed(&self, event: &str, key: &PluginKey) -> bool {
        self.by_event.get(event).is_some_and(|keys| keys.contains(key))
    }

    /// Total number of (event, key) pairs.
    pub fn len(&self) -> usize {
        self.by_event.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn event_count(&self) -> usize {
        self.by_event.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn duplicates_collapse() {
        let mut reg = SubscriptionRegistry::new();
        let key = PluginKey::generate();
        assert!(reg.subscribe("tick", key));
        assert!(!reg.subscribe("tick", key));
        assert_eq!(reg.subscribers("tick"), vec![key]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let mut reg = SubscriptionRegistry::new();
        let key = PluginKey::generate();
        assert!(!reg.unsubscribe("tick", &key));
        reg.subscribe("tick", key);
        assert!(reg.unsubscribe("tick", &key));
        assert!(!reg.unsubscribe("tick", &key));
        assert!(reg.is_empty());
        assert!(reg.subscribers("tick").is_empty());
    }

    #[test]
    fn remove_key_purges_all_events() {
        let mut reg = SubscriptionRegistry::new();
        let gone = PluginKey::generate();
        let stays = PluginKey::generate();
        reg.subscribe("a", gone);
        reg.subscribe("b", gone);
        reg.subscribe("b", stays);

        assert_eq!(reg.remove_key(&gone), 2);
        assert_eq!(reg.event_count(), 1);
        assert_eq!(reg.subscribers("b"), vec![stays]);
        assert_eq!(reg.remove_key(&gone), 0);
    }

    proptest! {
        #[test]
        fn indexes_stay_consistent(ops in prop::collection::vec((0u8..3, 0usize..4, 0usize..3), 0..64)) {
            let keys: Vec<PluginKey> = (0..4u8).map(|i| PluginKey::from_bytes([i; 32])).collect();
            let events = ["a", "b", "c"];
            let mut reg = SubscriptionRegistry::new();
            for (op, k, e) in ops {
                match op {
                    0 => { reg.subscribe(events[e], keys[k]); }
                    1 => { reg.unsubscribe(events[e], &keys[k]); }
                    _ => { reg.remove_key(&keys[k]); }
                }
            }
            let forward: usize = reg.by_event.values().map(HashSet::len).sum();
            let reverse: usize = reg.by_key.values().map(HashSet::len).sum();
            prop_assert_eq!(forward, reverse);
            prop_assert!(reg.by_event.values().all(|s| !s.is_empty()));
            prop_assert!(reg.by_key.values().all(|s| !s.is_empty()));
        }
    }
}
