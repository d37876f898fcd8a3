use committable::{Commitment, Committable, RawCommitmentBuilder};
use constant_time_eq::constant_time_eq;
use serde::{Deserialize, Serialize};

use crate::{Committee, Keypair, PublicKey, Signature};

/// Data together with a signature over its commitment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signed<D: Committable> {
    data: D,
    commitment: Commitment<D>,
    signature: Signature,
    signing_key: PublicKey,
}

impl<D: Committable> Signed<D> {
    pub fn new(d: D, keypair: &Keypair, deterministic: bool) -> Self {
        let c = d.commit();
        let s = if deterministic {
            keypair.sign_deterministically(c.as_ref())
        } else {
            keypair.sign(c.as_ref())
        };
        Self {
            data: d,
            commitment: c,
            signature: s,
            signing_key: keypair.public_key(),
        }
    }

    /// Re-assemble signed data from a detached signature.
    ///
    /// The result is not checked in any way, use `is_valid` before trusting it.
    pub fn from_parts(d: D, signature: Signature, signing_key: PublicKey) -> Self {
        Self {
            commitment: d.commit(),
            data: d,
            signature,
            signing_key,
        }
    }

    pub fn is_valid(&self, c: &Committee) -> bool {
        c.contains_key(&self.signing_key)
            && constant_time_eq(self.data.commit().as_ref(), self.commitment.as_ref())
            && self
                .signing_key
                .is_valid(self.commitment.as_ref(), &self.signature)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn signing_key(&self) -> &PublicKey {
        &self.signing_key
    }

    pub fn commitment(&self) -> Commitment<D> {
        self.commitment
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn into_data(self) -> D {
        self.data
    }
}

impl<D: Committable> Committable for Signed<D> {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("Signed")
            .field("data", self.data.commit())
            .field("commitment", self.commitment)
            .field("signature", self.signature.commit())
            .fixed_size_field("signing_key", &self.signing_key.as_bytes())
            .finalize()
    }
}
