//! Distributed key generation result model and the block arithmetic driving
//! on-chain result publication.

use crate::domain::group::GroupParameters;
use crate::foundation::{BridgeError, Hash32, MemberIndex, OperatorAddress, OperatorId, Result, PRE_PUBLICATION_BLOCKS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// View of the group as seen by a member once the DKG protocol finished:
/// the full index space plus the indexes the protocol marked as misbehaving
/// (inactive or disqualified).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupView {
    group_size: MemberIndex,
    misbehaved: BTreeSet<MemberIndex>,
}

impl GroupView {
    pub fn new(group_size: MemberIndex, misbehaved: impl IntoIterator<Item = MemberIndex>) -> Self {
        Self { group_size, misbehaved: misbehaved.into_iter().collect() }
    }

    pub fn group_size(&self) -> MemberIndex {
        self.group_size
    }

    pub fn member_indexes(&self) -> Vec<MemberIndex> {
        (1..=self.group_size).collect()
    }

    /// Indexes of members that were neither disqualified nor inactive,
    /// ascending.
    pub fn operating_member_indexes(&self) -> Vec<MemberIndex> {
        (1..=self.group_size).filter(|index| !self.misbehaved.contains(index)).collect()
    }

    /// Misbehaved indexes, ascending.
    pub fn misbehaved_member_indexes(&self) -> Vec<MemberIndex> {
        self.misbehaved.iter().copied().collect()
    }
}

/// Pre-computed parameters consumed by one protocol execution. Expensive to
/// produce, hence generated in the background and pooled. Opaque to
/// everything but the protocol backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaPreParams {
    pub blob: Vec<u8>,
}

/// Outcome of the DKG protocol for a single controlled member index.
/// The private key share is an opaque blob owned by the threshold-signing
/// backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DkgResult {
    /// Compressed secp256k1 group public key.
    pub group_public_key: Vec<u8>,
    pub group: GroupView,
    pub private_key_share: Vec<u8>,
}

/// Result hash signed by a member together with the signing key material,
/// broadcast to peers during the publication phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedDkgResult {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub result_hash: Hash32,
}

/// DKG result assembled according to the rules of the host chain, ready for
/// on-chain submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgChainResult {
    pub submitter_member_index: MemberIndex,
    pub group_public_key: Vec<u8>,
    pub misbehaved_members_indexes: Vec<MemberIndex>,
    pub signatures: BTreeMap<MemberIndex, Vec<u8>>,
    pub signing_members_indexes: Vec<MemberIndex>,
    pub members: Vec<OperatorId>,
    pub members_hash: Hash32,
}

/// Canonical 32-byte hash supporting a DKG result: the group public key, the
/// sorted misbehaved indexes, and the DKG start block, domain separated.
/// Members sign this hash; the chain accepts a result only with a quorum of
/// signatures over the exact same value.
pub fn canonical_result_signature_hash(
    group_public_key: &[u8],
    misbehaved_members_indexes: &[MemberIndex],
    start_block: u64,
) -> Hash32 {
    let mut sorted = misbehaved_members_indexes.to_vec();
    sorted.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tideway:dkg_result:v1:");
    hasher.update(group_public_key);
    for index in sorted {
        hasher.update(&index.to_le_bytes());
    }
    hasher.update(&start_block.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// First block at which the given member may attempt on-chain result
/// submission. Member 1 is eligible straight away; each following member
/// becomes eligible one block step later.
pub fn eligible_submission_block(publication_start_block: u64, member_index: MemberIndex, block_step: u64) -> u64 {
    publication_start_block + (member_index as u64 - 1) * block_step
}

/// Block at which the whole publication phase times out: no member submitted
/// although every one of them got an eligibility window.
pub fn publication_timeout_block(publication_start_block: u64, params: &GroupParameters, block_step: u64) -> u64 {
    publication_start_block + PRE_PUBLICATION_BLOCKS + params.group_size as u64 * block_step
}

/// Decides what a member does after it failed to publish its own DKG result
/// and observed the result accepted on-chain instead. The member stays in the
/// group only if it supports the same group public key and is not considered
/// misbehaving by the accepted result. Returns the operating member indexes
/// according to the accepted result.
pub fn decide_member_fate(
    member_index: MemberIndex,
    local_result: &DkgResult,
    accepted_group_public_key: &[u8],
    accepted_misbehaved: &[MemberIndex],
) -> Result<Vec<MemberIndex>> {
    if local_result.group_public_key != accepted_group_public_key {
        return Err(BridgeError::CouldNotStay {
            member_index,
            details: "member does not support the same group public key".to_string(),
        });
    }

    let misbehaved: BTreeSet<MemberIndex> = accepted_misbehaved.iter().copied().collect();

    if misbehaved.contains(&member_index) {
        return Err(BridgeError::CouldNotStay {
            member_index,
            details: "member is considered as misbehaving".to_string(),
        });
    }

    Ok(local_result.group.member_indexes().into_iter().filter(|index| !misbehaved.contains(index)).collect())
}

/// Transforms the ordered selection outcome into the addresses of the
/// operators that actually form the group: the selected operator list is
/// indexed with the (sorted) operating member indexes, each shifted to the
/// 0-based selection slot.
pub fn resolve_final_signing_group_operators(
    selected_operators: &[OperatorAddress],
    operating_members_indexes: &[MemberIndex],
    params: &GroupParameters,
) -> Result<Vec<OperatorAddress>> {
    if selected_operators.len() != params.group_size as usize {
        return Err(BridgeError::InvalidDkgResult(format!(
            "selected operators count {} does not match group size {}",
            selected_operators.len(),
            params.group_size,
        )));
    }

    if operating_members_indexes.len() < params.group_quorum as usize {
        return Err(BridgeError::InvalidDkgResult(format!(
            "operating members count {} below group quorum {}",
            operating_members_indexes.len(),
            params.group_quorum,
        )));
    }

    let mut sorted = operating_members_indexes.to_vec();
    sorted.sort_unstable();

    Ok(sorted.into_iter().map(|index| selected_operators[index as usize - 1].clone()).collect())
}

/// Chain-side validity rules for a submitted DKG result. The caller supplies
/// lookups for member public keys and for signature verification; the chain
/// facade owns both.
pub fn validate_dkg_chain_result<K, V>(
    result: &DkgChainResult,
    params: &GroupParameters,
    expected_result_hash: &Hash32,
    member_public_key: K,
    verify_signature: V,
) -> std::result::Result<(), String>
where
    K: Fn(MemberIndex) -> Option<secp256k1::PublicKey>,
    V: Fn(&Hash32, &[u8], &secp256k1::PublicKey) -> bool,
{
    if result.signatures.len() < params.group_quorum as usize {
        return Err(format!(
            "got {} signatures, group quorum is {}",
            result.signatures.len(),
            params.group_quorum
        ));
    }

    if result.signatures.len() != result.signing_members_indexes.len() {
        return Err("signatures and signing member indexes length mismatch".to_string());
    }

    let misbehaved: BTreeSet<MemberIndex> = result.misbehaved_members_indexes.iter().copied().collect();

    for (member_index, signature) in &result.signatures {
        if *member_index < 1 || *member_index > params.group_size {
            return Err(format!("signing member index {} out of range", member_index));
        }
        if misbehaved.contains(member_index) {
            return Err(format!("signing member index {} is misbehaved", member_index));
        }

        let public_key = member_public_key(*member_index)
            .ok_or_else(|| format!("no public key known for member {}", member_index))?;

        if !verify_signature(expected_result_hash, signature, &public_key) {
            return Err(format!("invalid signature of member {}", member_index));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_result(group_public_key: &[u8]) -> DkgResult {
        DkgResult {
            group_public_key: group_public_key.to_vec(),
            group: GroupView::new(5, [2]),
            private_key_share: vec![0u8; 32],
        }
    }

    #[test]
    fn eligible_submission_block_staggers_members() {
        assert_eq!(eligible_submission_block(200, 1, 6), 200);
        assert_eq!(eligible_submission_block(200, 2, 6), 206);
        assert_eq!(eligible_submission_block(200, 10, 6), 254);
    }

    #[test]
    fn publication_timeout_covers_every_member_window() {
        let params = GroupParameters { group_size: 64, group_quorum: 58, honest_threshold: 33 };
        assert_eq!(publication_timeout_block(100, &params, 6), 100 + 5 + 64 * 6);
    }

    #[test]
    fn member_stays_when_it_supports_the_accepted_result() {
        let result = local_result(&[0xAA; 33]);
        let operating = decide_member_fate(4, &result, &[0xAA; 33], &[2]).expect("member stays");
        assert_eq!(operating, vec![1, 3, 4, 5]);
    }

    #[test]
    fn member_cannot_stay_when_marked_misbehaved() {
        let result = local_result(&[0xAA; 33]);
        let err = decide_member_fate(4, &result, &[0xAA; 33], &[4]).expect_err("member leaves");
        assert!(matches!(err, BridgeError::CouldNotStay { member_index: 4, .. }));
        assert!(err.to_string().contains("could not stay"));
    }

    #[test]
    fn member_cannot_stay_on_group_key_fork() {
        let result = local_result(&[0xAA; 33]);
        let err = decide_member_fate(1, &result, &[0xBB; 33], &[]).expect_err("member leaves");
        assert!(matches!(err, BridgeError::CouldNotStay { member_index: 1, .. }));
    }

    #[test]
    fn final_operators_follow_sorted_operating_indexes() {
        let params = GroupParameters { group_size: 5, group_quorum: 3, honest_threshold: 3 };
        let selected: Vec<OperatorAddress> =
            ["0x01", "0x02", "0x03", "0x04", "0x05"].iter().map(|a| OperatorAddress::new(*a)).collect();

        let operators =
            resolve_final_signing_group_operators(&selected, &[5, 1, 3], &params).expect("resolved operators");
        assert_eq!(
            operators,
            vec![OperatorAddress::new("0x01"), OperatorAddress::new("0x03"), OperatorAddress::new("0x05")]
        );
    }

    #[test]
    fn final_operators_require_group_quorum() {
        let params = GroupParameters { group_size: 5, group_quorum: 3, honest_threshold: 3 };
        let selected: Vec<OperatorAddress> =
            ["0x01", "0x02", "0x03", "0x04", "0x05"].iter().map(|a| OperatorAddress::new(*a)).collect();

        assert!(resolve_final_signing_group_operators(&selected, &[1, 2], &params).is_err());
    }

    #[test]
    fn result_signature_hash_is_insensitive_to_misbehaved_order() {
        let left = canonical_result_signature_hash(&[0x02; 33], &[7, 3], 100);
        let right = canonical_result_signature_hash(&[0x02; 33], &[3, 7], 100);
        assert_eq!(left, right);

        let other_block = canonical_result_signature_hash(&[0x02; 33], &[3, 7], 101);
        assert_ne!(left, other_block);
    }
}
