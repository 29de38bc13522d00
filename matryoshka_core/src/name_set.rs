//! Ordered set of entity names with a content digest.
//!
//! The digest is an XOR fold over the textual names in insertion order,
//! finished with 32-bit FNV-1a:
//!
//! ```text
//! key = "debug"
//! for s in names:  key = [ s[i] ^ key[i % len(key)] for i in 0..len(s) ]
//! digest = fnv1a(key)
//! ```
//!
//! Peers compare digests to decide whether a region's membership differs,
//! so the fold must stay bit-exact across implementations. Insertion order
//! is part of the content: the same names inserted in a different order
//! produce a different digest.

use crate::entity::EntityName;

/// Initial fold key.
pub const DIGEST_SEED: &[u8] = b"debug";

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(FNV_PRIME)
    })
}

fn xor_fold(key: &[u8], input: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return input.to_vec();
    }
    input
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

/// Digest of a sequence of names, in the given order.
pub fn digest_names<'a>(names: impl IntoIterator<Item = &'a EntityName>) -> u32 {
    let folded = names.into_iter().fold(DIGEST_SEED.to_vec(), |key, name| {
        xor_fold(&key, name.to_string().as_bytes())
    });
    fnv1a(&folded)
}

/// Insertion-ordered set of names with a cached digest.
///
/// The cache only changes on [`NameSet::refresh_digest`]; callers that
/// mutate the set are expected to refresh before publishing the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameSet {
    names: Vec<EntityName>,
    digest: u32,
}

impl NameSet {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            digest: digest_names(std::iter::empty()),
        }
    }
    
    /// Appends `name` unless already present. Returns true if inserted.
    pub fn insert(&mut self, name: EntityName) -> bool {
        if self.contains(&name) {
            return false;
        }
        self.names.push(name);
        true
    }
    
    /// Removes `name`, keeping the order of the rest. Returns true if removed.
    pub fn remove(&mut self, name: &EntityName) -> bool {
        match self.names.iter().position(|n| n == name) {
            Some(idx) => {
                self.names.remove(idx);
                true
            }
            None => false,
        }
    }
    
    pub fn contains(&self, name: &EntityName) -> bool {
        self.names.iter().any(|n| n == name)
    }
    
    pub fn len(&self) -> usize {
        self.names.len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
    
    pub fn iter(&self) -> impl Iterator<Item = &EntityName> {
        self.names.iter()
    }
    
    /// Appends every name of `other` not already present, in `other`'s order.
    pub fn extend_from(&mut self, other: &NameSet) {
        for name in other.iter() {
            self.insert(name.clone());
        }
    }
    
    /// Digest of the current content, ignoring the cache.
    pub fn compute_digest(&self) -> u32 {
        digest_names(self.names.iter())
    }
    
    /// Recomputes and caches the digest.
    pub fn refresh_digest(&mut self) -> u32 {
        self.digest = self.compute_digest();
        self.digest
    }
    
    /// Digest as of the last refresh.
    pub fn digest(&self) -> u32 {
        self.digest
    }
}

impl Default for NameSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<EntityName> for NameSet {
    fn from_iter<I: IntoIterator<Item = EntityName>>(iter: I) -> Self {
        let mut set = Self::new();
        for name in iter {
            set.insert(name);
        }
        set.refresh_digest();
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    
    fn name(owner: &str, id: &str) -> EntityName {
        EntityName::new(owner, id).unwrap()
    }
    
    #[test]
    fn test_empty_digest_is_hash_of_seed() {
        assert_eq!(fnv1a(b"debug"), 0x5864_ed98);
        assert_eq!(NameSet::new().digest(), 0x5864_ed98);
    }
    
    #[test]
    fn test_digest_reference_values() {
        let alice = name("/a", "alice");
        let bob = name("/b", "bob");
        assert_eq!(digest_names([&alice]), 3_779_237_869);
        assert_eq!(digest_names([&alice, &bob]), 2_923_164_270);
        // Order is part of the content
        assert_eq!(digest_names([&bob, &alice]), 1_855_449_584);
    }
    
    #[test]
    fn test_cache_only_changes_on_refresh() {
        let mut set = NameSet::new();
        let before = set.digest();
        assert!(set.insert(name("/a", "alice")));
        assert_eq!(set.digest(), before);
        
        let after = set.refresh_digest();
        assert_ne!(after, before);
        assert_eq!(set.digest(), after);
    }
    
    #[test]
    fn test_insert_is_set_like() {
        let mut set = NameSet::new();
        assert!(set.insert(name("/a", "alice")));
        assert!(!set.insert(name("/a", "alice")));
        assert_eq!(set.len(), 1);
        
        assert!(set.remove(&name("/a", "alice")));
        assert!(!set.remove(&name("/a", "alice")));
        assert!(set.is_empty());
    }
    
    #[test]
    fn test_remove_then_reinsert_restores_digest() {
        let mut set: NameSet = [name("/a", "x"), name("/a", "y")].into_iter().collect();
        let original = set.digest();
        
        set.remove(&name("/a", "y"));
        set.refresh_digest();
        set.insert(name("/a", "y"));
        assert_eq!(set.refresh_digest(), original);
    }
    
    proptest! {
        #[test]
        fn prop_digest_is_pure(ids in proptest::collection::vec("[a-z]{1,8}", 0..6)) {
            let names: Vec<EntityName> = ids.iter().map(|id| name("/hub", id)).collect();
            prop_assert_eq!(digest_names(names.iter()), digest_names(names.iter()));
        }
        
        #[test]
        fn prop_distinct_singletons_differ(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            prop_assume!(a != b);
            prop_assert_ne!(digest_names([&name("/hub", &a)]), digest_names([&name("/hub", &b)]));
        }
    }
}
