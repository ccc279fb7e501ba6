use std::hash::{BuildHasher, Hash, Hasher};

use ahash::{AHasher, RandomState};

/// The `DefaultHash` trait is used to obtain a hash value for a single typed
/// value. It will rely on the default `Hasher` provided by the std library.
pub trait DefaultHash {
    fn default_hash(&self) -> u64;
}

// Default implementation of DefaultHash for all types that implement the `Hash`
// trait.
impl<T> DefaultHash for T
where
    T: Hash,
{
    /// Returns the hash value for a single typed value, using `DefaultHasher`.
    fn default_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

pub struct DefaultHasher {}

impl DefaultHasher {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> AHasher {
        let builder = FixedState::default();
        builder.build_hasher()
    }
}

/// A hasher builder that will create a fixed hasher.
#[derive(Debug, Clone, Default)]
pub struct FixedState;

impl BuildHasher for FixedState {
    type Hasher = AHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        AHasher::new_with_keys(
            0b1001010111101110000001001100010000000011001001101011001001111000,
            0b1100111101101011011110001011010100000100001111100011010011010101,
        )
    }
}

/// A [`HashMap`][hashbrown::HashMap] implementing aHash, a high
/// speed keyed hashing algorithm intended for use in in-memory hashmaps.
///
/// aHash is designed for performance and is NOT cryptographically secure.
pub type HashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;

/// A [`HashSet`][hashbrown::HashSet] implementing aHash, a high
/// speed keyed hashing algorithm intended for use in in-memory hashmaps.
///
/// aHash is designed for performance and is NOT cryptographically secure.
pub type HashSet<K> = hashbrown::HashSet<K, RandomState>;

/// A stable hash map implementing aHash, a high speed keyed hashing algorithm
/// intended for use in in-memory hashmaps.
///
/// Unlike [`HashMap`] this has an iteration order that only depends on the order
/// of insertions and deletions and not a random source.
///
/// aHash is designed for performance and is NOT cryptographically secure.
pub type StableHashMap<K, V> = hashbrown::HashMap<K, V, FixedState>;

/// A stable hash set implementing aHash, a high speed keyed hashing algorithm
/// intended for use in in-memory hashmaps.
///
/// Unlike [`HashSet`] this has an iteration order that only depends on the order
/// of insertions and deletions and not a random source.
///
/// aHash is designed for performance and is NOT cryptographically secure.
pub type StableHashSet<K> = hashbrown::HashSet<K, FixedState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_state_is_deterministic() {
        assert_eq!("quarry".default_hash(), "quarry".default_hash());
        assert_ne!("quarry".default_hash(), "quarries".default_hash());
    }

    #[test]
    fn stable_map_preserves_insertion_order() {
        let mut map = StableHashMap::<u32, &str>::default();
        map.insert(3, "c");
        map.insert(1, "a");
        map.insert(2, "b");
        let keys: Vec<u32> = map.keys().copied().collect();
        let mut map2 = StableHashMap::<u32, &str>::default();
        map2.insert(3, "c");
        map2.insert(1, "a");
        map2.insert(2, "b");
        let keys2: Vec<u32> = map2.keys().copied().collect();
        assert_eq!(keys, keys2);
    }
}
