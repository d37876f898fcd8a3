use std::fmt;

use dbft_types::{Height, ViewNumber};
use multisig::{Committee, KeyId};

/// Quorum parameters of a committee.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Quorum {
    /// Committee size.
    pub n: usize,
    /// Maximum number of faulty members.
    pub f: usize,
    /// Number of matching votes required to advance.
    pub m: usize,
}

impl Quorum {
    pub fn new(n: usize) -> Self {
        debug_assert!(n > 0);
        let f = n.saturating_sub(1) / 3;
        Self { n, f, m: n - f }
    }
}

impl From<&Committee> for Quorum {
    fn from(c: &Committee) -> Self {
        Self::new(c.size().get())
    }
}

/// The committee index of the proposer for the given height and view.
pub fn primary_index(h: Height, v: ViewNumber, n: usize) -> KeyId {
    let i = (u64::from(h) + u64::from(v)) % n as u64;
    KeyId::from(i as u8)
}

/// What a node does in a round.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Proposer,
    Voter,
    /// Not a committee member, never votes or proposes.
    Observer,
}

pub fn role_of(me: Option<KeyId>, primary: KeyId) -> Role {
    match me {
        Some(i) if i == primary => Role::Proposer,
        Some(_) => Role::Voter,
        None => Role::Observer,
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposer => f.write_str("proposer"),
            Self::Voter => f.write_str("voter"),
            Self::Observer => f.write_str("observer"),
        }
    }
}
