//! Hash map aliases backed by `hashbrown` and `ahash`.

/// Hash map used for small id lookup tables.
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;

/// Creates an empty [`FastHashMap`] with room for `capacity` entries.
#[must_use]
pub fn map_with_capacity<K, V>(capacity: usize) -> FastHashMap<K, V> {
    FastHashMap::with_capacity_and_hasher(capacity, ahash::RandomState::new())
}
