//! Relay entry requests and the block-indexed eligibility window for entry
//! submission.

use crate::foundation::util::encoding::bytes_mod;
use crate::foundation::MemberIndex;
use serde::{Deserialize, Serialize};

/// An active request for a new relay entry. At most one request may be in
/// progress; `id == 0` means no request is in progress.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayRequest {
    pub id: u64,
    pub group_id: u64,
    pub start_block: u64,
    pub previous_entry: Vec<u8>,
}

impl RelayRequest {
    pub fn in_progress(&self) -> bool {
        self.id != 0
    }
}

/// Range of member indexes eligible to submit a relay entry at some block,
/// possibly wrapping around the end of the index space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EligibleIndexRange {
    pub first: MemberIndex,
    pub last: MemberIndex,
    pub group_size: MemberIndex,
}

impl EligibleIndexRange {
    pub fn contains(&self, index: MemberIndex) -> bool {
        if index < 1 || index > self.group_size {
            return false;
        }
        if self.first <= self.last {
            self.first <= index && index <= self.last
        } else {
            // Wrapped range, e.g. [62, 8] in a 64-member group.
            index >= self.first || index <= self.last
        }
    }
}

/// Computes which members may submit the next relay entry at
/// `current_block`. The first eligible index is seeded by the previous
/// entry; one more member becomes eligible every `block_step` blocks, up to
/// the whole group.
pub fn entry_submission_eligibility_range(
    previous_entry: &[u8],
    group_size: MemberIndex,
    start_block: u64,
    block_step: u64,
    current_block: u64,
) -> EligibleIndexRange {
    let first = (bytes_mod(previous_entry, group_size as u64) + 1) as MemberIndex;

    let elapsed = current_block.saturating_sub(start_block);
    let shift = (elapsed / block_step).min(group_size as u64 - 1) as MemberIndex;

    // Shift the end of the range, wrapping back into [1, group_size].
    let last = (first as u64 + shift as u64 - 1) % group_size as u64 + 1;

    EligibleIndexRange { first, last: last as MemberIndex, group_size }
}
