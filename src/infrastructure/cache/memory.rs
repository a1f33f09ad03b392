#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;

use dashmap::DashMap;

use crate::domain::models::QueryCache;
use crate::domain::models::QueryKey;

/// Process-local invalidation log. The CLI holds no derived query results, so
/// every invalidation only bumps the key's generation.
#[derive(Default)]
pub struct InMemoryQueryCache {
    generations: DashMap<QueryKey, u64>,
}

impl QueryCache for InMemoryQueryCache {
    fn invalidate(&self, key: &QueryKey) {
        let mut entry = self.generations.entry(key.clone()).or_insert(0);
        *entry += 1;
        let generation = *entry;
        drop(entry);

        tracing::debug!(key = %key, generation, "Invalidated query");
    }
}
