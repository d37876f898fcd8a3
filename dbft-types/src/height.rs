use std::fmt;
use std::ops::{Add, Deref, Sub};

use committable::{Commitment, Committable, RawCommitmentBuilder};
use serde::{Deserialize, Serialize};

/// The sequence number of a block.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Height(u32);

impl Height {
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    pub fn genesis() -> Self {
        Self(0)
    }

    pub fn is_genesis(self) -> bool {
        self.0 == 0
    }

    pub fn u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for Height {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<Height> for u32 {
    fn from(val: Height) -> Self {
        val.0
    }
}

impl From<Height> for u64 {
    fn from(val: Height) -> Self {
        val.0.into()
    }
}

impl Add<u32> for Height {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<u32> for Height {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0.saturating_sub(rhs))
    }
}

impl Deref for Height {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Committable for Height {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("Height").u32(self.0).finalize()
    }
}

/// A sub-round within a height.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ViewNumber(u8);

impl ViewNumber {
    pub const fn new(val: u8) -> Self {
        Self(val)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn u8(self) -> u8 {
        self.0
    }

    /// The next view, saturating at the maximum.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u8> for ViewNumber {
    fn from(val: u8) -> Self {
        Self(val)
    }
}

impl From<ViewNumber> for u8 {
    fn from(val: ViewNumber) -> Self {
        val.0
    }
}

impl From<ViewNumber> for u64 {
    fn from(val: ViewNumber) -> Self {
        val.0.into()
    }
}

impl Deref for ViewNumber {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ViewNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the round a timer has been armed for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundTag {
    pub height: Height,
    pub view: ViewNumber,
}

impl RoundTag {
    pub fn new(height: Height, view: ViewNumber) -> Self {
        Self { height, view }
    }
}

impl fmt::Display for RoundTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.view)
    }
}
