//! Group state: records, epochs, and deterministic master election.
//!
//! Groups converge without election traffic. Every node runs the same
//! local rule over the members it can currently reach, and announcements
//! are ordered by a monotone epoch with a lexicographic tiebreak, so
//! agreement emerges once the active-member sets do.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::identity;

/// One group as this node believes it to be.
///
/// Invariant: `master_id` is always a member. Members are kept sorted and
/// de-duplicated by the `BTreeSet`, which also makes persisted state
/// diff-stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub members: BTreeSet<String>,
    pub master_id: String,
    pub epoch: u64,
}

impl GroupRecord {
    pub fn new(name: impl Into<String>, members: BTreeSet<String>, master_id: String) -> Self {
        Self {
            name: name.into(),
            members,
            master_id,
            epoch: identity::timestamp(),
        }
    }
}

/// Elect the master for a candidate set: the lexicographically smallest
/// device id. Every peer computes the same result locally.
pub fn elect_master<'a, I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    candidates.into_iter().min().cloned()
}

/// Next epoch after a state change: the wall clock if it moved forward,
/// otherwise one past the previous epoch. Strictly monotonic either way.
pub fn next_epoch(previous: u64) -> u64 {
    let now = identity::timestamp();
    if now > previous {
        now
    } else {
        previous + 1
    }
}

/// Whether an incoming `group_master` announcement beats the local record.
/// Higher epoch wins; an equal epoch is resolved toward the
/// lexicographically greater master id. No local record always loses.
pub fn accepts_announcement(local: Option<&GroupRecord>, master_id: &str, epoch: u64) -> bool {
    match local {
        None => true,
        Some(record) => {
            epoch > record.epoch || (epoch == record.epoch && *master_id > *record.master_id)
        }
    }
}
