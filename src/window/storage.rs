use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

/// `localStorage` / `sessionStorage`. Keys keep insertion order so `key(n)`
/// is stable.
#[derive(Debug, Clone, Default)]
pub struct Storage {
    entries: Arc<RwLock<Vec<(String, String)>>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn length(&self) -> usize {
        self.entries.read().len()
    }

    pub fn key(&self, index: usize) -> Option<String> {
        self.entries.read().get(index).map(|(key, _)| key.clone())
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.clone())
    }

    pub fn set_item(&self, key: &str, value: &str) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn remove_item(&self, key: &str) {
        self.entries.write().retain(|(k, _)| k != key);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// One [`Storage`] per origin.
#[derive(Debug, Default)]
pub(crate) struct StorageAreas {
    areas: DashMap<String, Storage>,
}

impl StorageAreas {
    pub(crate) fn for_origin(&self, origin: &str) -> Storage {
        self.areas.entry(origin.to_string()).or_default().clone()
    }

    pub(crate) fn clear(&self) {
        self.areas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_keep_insertion_order() {
        let storage = Storage::new();
        storage.set_item("b", "1");
        storage.set_item("a", "2");
        storage.set_item("b", "3");
        assert_eq!(storage.length(), 2);
        assert_eq!(storage.key(0).as_deref(), Some("b"));
        assert_eq!(storage.get_item("b").as_deref(), Some("3"));
        storage.remove_item("b");
        assert_eq!(storage.key(0).as_deref(), Some("a"));
        storage.clear();
        assert_eq!(storage.get_item("a"), None);
    }

    #[test]
    fn areas_are_shared_per_origin() {
        let areas = StorageAreas::default();
        areas.for_origin("https://a.test").set_item("k", "v");
        assert_eq!(areas.for_origin("https://a.test").get_item("k").as_deref(), Some("v"));
        assert_eq!(areas.for_origin("https://b.test").length(), 0);
    }
}
