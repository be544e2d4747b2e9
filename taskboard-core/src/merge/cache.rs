/// Multi-source merge cache.
///
/// Each source owns a private id → entity map. The published snapshot is the
/// union of all maps, recomputed after every change: an id is visible while
/// at least one source holds it, exactly once, taking the value from the
/// lowest source key. Sources never write into each other's maps.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::types::Entity;

/// Upserts and removals from one source, applied removals-first.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch<T> {
    pub upserts: Vec<T>,
    pub removals: Vec<String>,
}

impl<T> Default for SourceBatch<T> {
    fn default() -> Self {
        Self {
            upserts: Vec::new(),
            removals: Vec::new(),
        }
    }
}

impl<T> SourceBatch<T> {
    pub fn upserts(upserts: Vec<T>) -> Self {
        Self {
            upserts,
            removals: Vec::new(),
        }
    }

    pub fn removals(removals: Vec<String>) -> Self {
        Self {
            upserts: Vec::new(),
            removals,
        }
    }
}

/// Value-union of the source maps, ordered by id. When several maps hold the
/// same id, the first map in key order wins.
pub fn union<K: Ord, T: Entity>(sources: &BTreeMap<K, BTreeMap<String, T>>) -> Vec<T> {
    let mut merged: BTreeMap<&str, &T> = BTreeMap::new();
    for map in sources.values() {
        for (id, entity) in map {
            merged.entry(id.as_str()).or_insert(entity);
        }
    }
    merged.into_values().cloned().collect()
}

#[derive(Debug, Clone)]
pub struct MergeCache<K: Ord, T> {
    sources: BTreeMap<K, BTreeMap<String, T>>,
    snapshot: Arc<Vec<T>>,
}

impl<K: Ord, T> Default for MergeCache<K, T> {
    fn default() -> Self {
        Self {
            sources: BTreeMap::new(),
            snapshot: Arc::new(Vec::new()),
        }
    }
}

impl<K: Ord, T: Entity> MergeCache<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.snapshot.clone()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.sources.values().find_map(|map| map.get(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn has_source(&self, source: &K) -> bool {
        self.sources.contains_key(source)
    }

    pub fn source_len(&self, source: &K) -> usize {
        self.sources.get(source).map_or(0, BTreeMap::len)
    }

    /// Apply one batch to `source`'s map only. Returns whether the published
    /// snapshot changed.
    pub fn apply_batch(&mut self, source: K, batch: SourceBatch<T>) -> bool {
        let map = self.sources.entry(source).or_default();
        for id in &batch.removals {
            map.remove(id);
        }
        for entity in batch.upserts {
            map.insert(entity.id().to_string(), entity);
        }
        self.republish()
    }

    pub fn upsert(&mut self, source: K, entity: T) -> bool {
        self.apply_batch(source, SourceBatch::upserts(vec![entity]))
    }

    /// Edit every copy of `id` held by any source. Returns false when no
    /// source holds it.
    pub fn update_in_place(&mut self, id: &str, mut edit: impl FnMut(&mut T)) -> bool {
        let mut found = false;
        for map in self.sources.values_mut() {
            if let Some(entity) = map.get_mut(id) {
                edit(entity);
                found = true;
            }
        }
        if found {
            self.republish();
        }
        found
    }

    pub fn remove_everywhere(&mut self, id: &str) -> bool {
        for map in self.sources.values_mut() {
            map.remove(id);
        }
        self.republish()
    }

    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        for map in self.sources.values_mut() {
            map.retain(|_, entity| !predicate(entity));
        }
        self.republish()
    }

    /// Replace a source's whole map, e.g. after a one-shot re-read.
    pub fn replace_source(&mut self, source: K, entities: Vec<T>) -> bool {
        let map = entities
            .into_iter()
            .map(|entity| (entity.id().to_string(), entity))
            .collect();
        self.sources.insert(source, map);
        self.republish()
    }

    pub fn drop_source(&mut self, source: &K) -> bool {
        if self.sources.remove(source).is_none() {
            return false;
        }
        self.republish()
    }

    fn republish(&mut self) -> bool {
        let next = union(&self.sources);
        if *self.snapshot == next {
            return false;
        }
        self.snapshot = Arc::new(next);
        true
    }
}

/// A merge cache shared between feed pumps and the mutation pipeline, with
/// its snapshot published on a watch channel.
pub struct SharedCache<K: Ord, T> {
    inner: Arc<Mutex<MergeCache<K, T>>>,
    tx: Arc<watch::Sender<Arc<Vec<T>>>>,
}

impl<K: Ord, T> Clone for SharedCache<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<K: Ord, T: Entity> Default for SharedCache<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, T: Entity> SharedCache<K, T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(Mutex::new(MergeCache::new())),
            tx: Arc::new(tx),
        }
    }

    /// Run `f` against the cache; a changed snapshot is published before the
    /// lock is released so watchers see changes in mutation order.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut MergeCache<K, T>) -> R) -> R {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = cache.snapshot();
        let result = f(&mut cache);
        let after = cache.snapshot();
        if !Arc::ptr_eq(&before, &after) {
            self.tx.send_replace(after);
        }
        result
    }

    pub fn read<R>(&self, f: impl FnOnce(&MergeCache<K, T>) -> R) -> R {
        let cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&cache)
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.tx.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.read(|cache| cache.get(id).cloned())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<T>>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        rev: u32,
    }

    impl Entity for Item {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn item(id: &str, rev: u32) -> Item {
        Item {
            id: id.to_string(),
            rev,
        }
    }

    fn ids(cache: &MergeCache<u8, Item>) -> Vec<String> {
        cache.snapshot().iter().map(|i| i.id.clone()).collect()
    }

    #[test]
    fn id_in_both_sources_appears_once() {
        let mut cache = MergeCache::new();
        cache.apply_batch(0u8, SourceBatch::upserts(vec![item("a", 1), item("b", 1)]));
        cache.apply_batch(1u8, SourceBatch::upserts(vec![item("b", 1), item("c", 1)]));
        assert_eq!(ids(&cache), ["a", "b", "c"]);
    }

    #[test]
    fn removal_from_one_source_keeps_id_held_by_other() {
        let mut cache = MergeCache::new();
        cache.upsert(0u8, item("a", 1));
        cache.upsert(1u8, item("a", 1));

        cache.apply_batch(1u8, SourceBatch::removals(vec!["a".into()]));
        assert_eq!(ids(&cache), ["a"]);

        cache.apply_batch(0u8, SourceBatch::removals(vec!["a".into()]));
        assert!(ids(&cache).is_empty());
    }

    #[test]
    fn lowest_source_wins_on_divergence() {
        let mut cache = MergeCache::new();
        cache.upsert(1u8, item("a", 7));
        cache.upsert(0u8, item("a", 3));
        assert_eq!(cache.snapshot()[0].rev, 3);
        assert_eq!(cache.get("a").map(|i| i.rev), Some(3));

        cache.apply_batch(0u8, SourceBatch::removals(vec!["a".into()]));
        assert_eq!(cache.snapshot()[0].rev, 7);
    }

    #[test]
    fn identical_upsert_does_not_republish() {
        let mut cache = MergeCache::new();
        assert!(cache.upsert(0u8, item("a", 1)));
        let before = cache.snapshot();
        assert!(!cache.upsert(0u8, item("a", 1)));
        assert!(Arc::ptr_eq(&before, &cache.snapshot()));
    }

    #[test]
    fn removals_apply_before_upserts_in_a_batch() {
        let mut cache = MergeCache::new();
        cache.upsert(0u8, item("a", 1));
        cache.apply_batch(
            0u8,
            SourceBatch {
                upserts: vec![item("a", 2)],
                removals: vec!["a".into()],
            },
        );
        assert_eq!(cache.snapshot()[0].rev, 2);
    }

    #[test]
    fn membership_matches_union_over_random_sequences() {
        // Small deterministic LCG so the sequence is reproducible.
        let mut seed: u32 = 0x2545_f491;
        let mut next = move || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            seed >> 16
        };

        let mut cache = MergeCache::new();
        let mut shadow: [BTreeMap<String, u32>; 2] = Default::default();
        for _ in 0..500 {
            let source = (next() % 2) as u8;
            let id = format!("d{}", next() % 6);
            if next() % 3 == 0 {
                shadow[source as usize].remove(&id);
                cache.apply_batch(source, SourceBatch::removals(vec![id]));
            } else {
                let rev = next() % 4;
                shadow[source as usize].insert(id.clone(), rev);
                cache.upsert(source, item(&id, rev));
            }

            let mut expected: Vec<String> = shadow[0]
                .keys()
                .chain(shadow[1].keys())
                .cloned()
                .collect();
            expected.sort();
            expected.dedup();
            assert_eq!(ids(&cache), expected);
        }
    }

    #[test]
    fn update_in_place_touches_every_copy() {
        let mut cache = MergeCache::new();
        cache.upsert(0u8, item("a", 1));
        cache.upsert(1u8, item("a", 1));
        assert!(cache.update_in_place("a", |i| i.rev = 9));
        cache.drop_source(&0);
        assert_eq!(cache.snapshot()[0].rev, 9);
        assert!(!cache.update_in_place("zzz", |i| i.rev = 1));
    }

    #[test]
    fn replace_and_drop_source() {
        let mut cache = MergeCache::new();
        cache.upsert(0u8, item("a", 1));
        cache.replace_source(0u8, vec![item("b", 1)]);
        assert_eq!(ids(&cache), ["b"]);
        assert!(cache.drop_source(&0));
        assert!(!cache.has_source(&0));
        assert!(ids(&cache).is_empty());
    }

    #[test]
    fn shared_cache_publishes_only_on_change() {
        let shared: SharedCache<u8, Item> = SharedCache::new();
        let mut rx = shared.subscribe();
        rx.borrow_and_update();

        shared.mutate(|c| c.upsert(0, item("a", 1)));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);

        shared.mutate(|c| c.upsert(0, item("a", 1)));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(shared.get("a"), Some(item("a", 1)));
    }
}
