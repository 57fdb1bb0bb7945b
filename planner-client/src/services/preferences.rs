use dashmap::DashMap;
use std::sync::Arc;

const ONBOARDING_COMPLETED: &str = "onboarding_completed";
const MIGRATION_COMPLETED: &str = "migration_completed";
const MIGRATION_VERSION: &str = "migration_version";

/// Durable string key/value storage supplied by the host platform.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Process-local store, used when the host provides no durable one.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, String>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Typed view over the flags the session needs to persist.
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn KeyValueStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::default()))
    }

    pub fn onboarding_completed(&self) -> bool {
        self.flag(ONBOARDING_COMPLETED)
    }

    pub fn set_onboarding_completed(&self, completed: bool) {
        self.store
            .set(ONBOARDING_COMPLETED, if completed { "true" } else { "false" });
    }

    /// Account migration version recorded as completed, if any.
    pub fn migration_version(&self) -> Option<u32> {
        if !self.flag(MIGRATION_COMPLETED) {
            return None;
        }
        self.store
            .get(MIGRATION_VERSION)
            .and_then(|v| v.parse().ok())
    }

    /// True once the migration to `target` (or later) has completed.
    pub fn is_migrated_to(&self, target: u32) -> bool {
        self.migration_version().is_some_and(|v| v >= target)
    }

    pub fn mark_migration_completed(&self, version: u32) {
        self.store.set(MIGRATION_VERSION, &version.to_string());
        self.store.set(MIGRATION_COMPLETED, "true");
    }

    pub fn reset_migration(&self) {
        self.store.remove(MIGRATION_COMPLETED);
        self.store.remove(MIGRATION_VERSION);
    }

    fn flag(&self, key: &str) -> bool {
        self.store.get(key).is_some_and(|v| v == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_store_has_no_migration() {
        let prefs = Preferences::in_memory();
        assert_eq!(prefs.migration_version(), None);
        assert!(!prefs.is_migrated_to(1));
        assert!(!prefs.onboarding_completed());
    }

    #[test]
    fn test_migration_marker() {
        let prefs = Preferences::in_memory();
        prefs.mark_migration_completed(2);
        assert_eq!(prefs.migration_version(), Some(2));
        assert!(prefs.is_migrated_to(1));
        assert!(prefs.is_migrated_to(2));
        assert!(!prefs.is_migrated_to(3));

        prefs.reset_migration();
        assert_eq!(prefs.migration_version(), None);
    }

    #[test]
    fn test_version_without_completion_flag_is_ignored() {
        let store = Arc::new(MemoryKeyValueStore::default());
        store.set(MIGRATION_VERSION, "4");
        let prefs = Preferences::new(store);
        assert_eq!(prefs.migration_version(), None);
    }

    #[test]
    fn test_onboarding_flag_round_trips() {
        let prefs = Preferences::in_memory();
        prefs.set_onboarding_completed(true);
        assert!(prefs.onboarding_completed());
        prefs.set_onboarding_completed(false);
        assert!(!prefs.onboarding_completed());
    }
}
