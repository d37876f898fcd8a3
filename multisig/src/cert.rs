use std::collections::BTreeMap;

use committable::{Commitment, Committable, RawCommitmentBuilder};
use constant_time_eq::constant_time_eq;
use serde::{Deserialize, Serialize};

use crate::{Committee, KeyId, PublicKey, Signature};

/// A quorum of committee signatures over some data.
///
/// The signatures are kept ordered by the signer's position in the committee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Certificate<D: Committable> {
    data: D,
    commitment: Commitment<D>,
    signatures: BTreeMap<KeyId, Signature>,
}

impl<D: Committable> Certificate<D> {
    pub fn new<I>(data: D, sigs: I) -> Self
    where
        I: IntoIterator<Item = (KeyId, Signature)>,
    {
        Self {
            commitment: data.commit(),
            data,
            signatures: sigs.into_iter().collect(),
        }
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn into_data(self) -> D {
        self.data
    }

    pub fn commitment(&self) -> &Commitment<D> {
        &self.commitment
    }

    pub fn signatures(&self) -> &BTreeMap<KeyId, Signature> {
        &self.signatures
    }

    pub fn signers<'a>(&'a self, comm: &'a Committee) -> impl Iterator<Item = PublicKey> + 'a {
        self.signatures
            .keys()
            .copied()
            .filter_map(move |i| comm.get_key(i).copied())
    }

    /// Check that a quorum of distinct committee members signed the data.
    pub fn is_valid(&self, c: &Committee) -> bool {
        let d = constant_time_eq(self.data.commit().as_ref(), self.commitment.as_ref());

        let n: usize = self
            .signatures
            .iter()
            .map(|(i, s)| {
                let Some(k) = c.get_key(*i) else {
                    return 0;
                };
                k.is_valid(self.commitment.as_ref(), s) as usize
            })
            .sum();

        d && n >= c.quorum_size().get()
    }
}

impl<D: Committable> Committable for Certificate<D> {
    fn commit(&self) -> Commitment<Self> {
        let builder = RawCommitmentBuilder::new("Certificate")
            .field("data", self.data.commit())
            .field("commitment", self.commitment)
            .u64_field("quorum", self.signatures.len() as u64);
        self.signatures
            .iter()
            .fold(builder, |b, (&i, s)| {
                b.u64_field("index", i.into()).field("sig", s.commit())
            })
            .finalize()
    }
}
