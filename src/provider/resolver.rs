//! Lazily populated name↔id cache shared by the backends.
//!
//! Misses trigger the backend's own full-list refresh; writes (create,
//! destroy) invalidate. The cache itself stays dumb so each backend keeps
//! control of how a refresh is priced.

use std::collections::HashMap;

use tokio::sync::RwLock;

pub struct ResolverCache<V: Clone> {
    map: RwLock<HashMap<String, V>>,
}

impl<V: Clone> ResolverCache<V> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, name: &str) -> Option<V> {
        self.map.read().await.get(name).cloned()
    }

    pub async fn insert(&self, name: impl Into<String>, value: V) {
        self.map.write().await.insert(name.into(), value);
    }

    pub async fn remove(&self, name: &str) -> Option<V> {
        self.map.write().await.remove(name)
    }

    /// Swap in a freshly listed mapping wholesale.
    pub async fn replace_all(&self, entries: impl IntoIterator<Item = (String, V)>) {
        let mut map = self.map.write().await;
        map.clear();
        map.extend(entries);
    }

    pub async fn clear(&self) {
        self.map.write().await.clear();
    }

    pub async fn names(&self) -> Vec<String> {
        self.map.read().await.keys().cloned().collect()
    }
}

impl<V: Clone> Default for ResolverCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
