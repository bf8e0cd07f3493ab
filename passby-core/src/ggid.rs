//! GGID: the 32-bit identifier a station advertises to say which exchange it supports.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Marks an identifier as taking part in wildcard negotiation.
pub const COMMON_BIT: u32 = 0x8000_0000;
/// "Accept any common protocol."
pub const COMMON_ANY: u32 = COMMON_BIT;
/// "Advertising generically; pick any concrete common protocol you have."
pub const COMMON_PARENT: u32 = COMMON_BIT | 0x0040_0120;

/// Application-chosen exchange identifier. `0` marks an unused registry slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ggid(pub u32);

impl Ggid {
    pub const EMPTY: Ggid = Ggid(0);
    pub const COMMON_ANY: Ggid = Ggid(COMMON_ANY);
    pub const COMMON_PARENT: Ggid = Ggid(COMMON_PARENT);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_common(self) -> bool {
        self.0 & COMMON_BIT != 0
    }

    /// Same identifier with the common bit set.
    pub fn to_common(self) -> Ggid {
        Ggid(self.0 | COMMON_BIT)
    }

    pub fn class(self) -> GgidClass {
        match self.0 {
            COMMON_ANY => GgidClass::CommonAny,
            COMMON_PARENT => GgidClass::CommonParent,
            v if v & COMMON_BIT != 0 => GgidClass::CommonConcrete(v),
            _ => GgidClass::Ordinary,
        }
    }
}

impl From<u32> for Ggid {
    fn from(v: u32) -> Self {
        Ggid(v)
    }
}

impl fmt::Display for Ggid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// How an identifier takes part in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgidClass {
    /// Exact peer-to-peer match required.
    Ordinary,
    CommonAny,
    CommonParent,
    CommonConcrete(u32),
}

/// Wildcard half of beacon matching: the resolved target when a remote and a local
/// identifier pair up through the common space, or `None`.
///
/// | remote \ local  | Any    | Parent | Concrete |
/// |-----------------|--------|--------|----------|
/// | Parent          | -      | local  | local    |
/// | Any / Concrete  | remote | -      | -        |
///
/// Ordinary identifiers never pair up here; they only match exactly.
pub fn wildcard_target(remote: Ggid, local: Ggid) -> Option<Ggid> {
    use GgidClass::*;
    match (remote.class(), local.class()) {
        (CommonParent, CommonParent | CommonConcrete(_)) => Some(local),
        (CommonAny | CommonConcrete(_), CommonAny) => Some(remote),
        _ => None,
    }
}
