//! Membership model derived from leader election.

use std::fmt;

use serde::{Deserialize, Serialize};

/// This member's slot in the consumer group.
///
/// Member numbers are 1-based and contiguous; vBucket ownership is a pure
/// function of `(member_number, total_members)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// 1-based index of this member.
    pub member_number: u32,
    /// Live member count.
    pub total_members: u32,
}

impl Membership {
    /// The membership of a client running without leader election.
    pub const SINGLE: Self = Self {
        member_number: 1,
        total_members: 1,
    };

    /// `true` when the pair is internally consistent.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.member_number >= 1
            && self.total_members >= 1
            && self.member_number <= self.total_members
    }
}

impl Default for Membership {
    fn default() -> Self {
        Self::SINGLE
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.member_number, self.total_members)
    }
}
