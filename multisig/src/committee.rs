use std::num::NonZeroUsize;
use std::sync::Arc;

use bimap::BiBTreeMap;

use super::{KeyId, PublicKey};

/// An ordered set of validators.
///
/// Every member is addressed by its position (`KeyId`) in the order the
/// keys were given. The order is significant: proposer rotation, recovery
/// responder selection and vote slots are all keyed by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committee {
    parties: Arc<BiBTreeMap<KeyId, PublicKey>>,
}

impl Committee {
    pub fn new<I>(it: I) -> Self
    where
        I: IntoIterator<Item = PublicKey>,
    {
        let map = BiBTreeMap::from_iter(it.into_iter().enumerate().map(|(i, k)| {
            let i = KeyId::try_from(i).expect("committee has at most 256 members");
            (i, k)
        }));
        assert!(!map.is_empty());
        Self {
            parties: Arc::new(map),
        }
    }

    /// Returns the size of the committee as a non-zero unsigned integer.
    pub fn size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.parties.len()).expect("committee is not empty")
    }

    /// The maximum number of faulty members tolerated, `(n - 1) / 3`.
    pub fn fault_tolerance(&self) -> usize {
        (self.parties.len() - 1) / 3
    }

    /// Computes the quorum size, `n - f`.
    pub fn quorum_size(&self) -> NonZeroUsize {
        let q = self.parties.len() - self.fault_tolerance();
        NonZeroUsize::new(q).expect("n - (n - 1) / 3 > 0")
    }

    /// Retrieves the public key associated with the given key ID.
    pub fn get_key<T: Into<KeyId>>(&self, ix: T) -> Option<&PublicKey> {
        self.parties.get_by_left(&ix.into())
    }

    /// Finds the key ID for a given public key.
    pub fn get_index(&self, k: &PublicKey) -> Option<KeyId> {
        self.parties.get_by_right(k).copied()
    }

    /// Checks if a public key is part of the committee.
    pub fn contains_key(&self, k: &PublicKey) -> bool {
        self.parties.contains_right(k)
    }

    /// Returns an iterator over all entries in the committee, ordered by key ID.
    pub fn entries(&self) -> impl Iterator<Item = (KeyId, &PublicKey)> {
        self.parties.iter().map(|e| (*e.0, e.1))
    }

    /// Provides an iterator over all public keys in the committee, ordered by key ID.
    pub fn parties(&self) -> impl Iterator<Item = &PublicKey> {
        self.parties.iter().map(|(_, k)| k)
    }
}
