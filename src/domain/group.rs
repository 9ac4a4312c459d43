use crate::foundation::{ChainAddress, MemberIndex, OperatorAddress, OperatorId};
use bitcoin::hashes::{hash160, Hash};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Control parameters of a signing group.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GroupParameters {
    /// Target number of members in a group.
    pub group_size: MemberIndex,
    /// Minimum number of group members required to produce and submit an
    /// acceptable group result.
    pub group_quorum: MemberIndex,
    /// Minimum number of active and honest members required for the group to
    /// remain operational.
    pub honest_threshold: MemberIndex,
}

impl GroupParameters {
    pub fn dishonest_threshold(&self) -> MemberIndex {
        self.group_size - self.honest_threshold
    }
}

impl Default for GroupParameters {
    fn default() -> Self {
        Self { group_size: 100, group_quorum: 90, honest_threshold: 51 }
    }
}

/// Result of a group selection: operators picked by the sortition pool for
/// the DKG protocol. Both slices have equal length and index `n` describes
/// the group member with index `n + 1`.
#[derive(Clone, Debug, Default)]
pub struct GroupSelectionResult {
    pub operators_ids: Vec<OperatorId>,
    pub operators_addresses: Vec<OperatorAddress>,
}

/// Derives the chain address of an operator from its public key: the hex
/// encoding of HASH160 over the compressed key.
pub fn operator_address_from_public_key(public_key: &PublicKey) -> OperatorAddress {
    let digest = hash160::Hash::hash(&public_key.serialize());
    OperatorAddress::new(format!("0x{}", hex::encode(digest.to_byte_array())))
}

/// All member indexes the given operator controls in the selected group, one
/// per selection slot, in ascending order. Indexes are 1-based.
pub fn member_indexes_of(operator: &OperatorAddress, selected_operators: &[OperatorAddress]) -> Vec<MemberIndex> {
    selected_operators
        .iter()
        .enumerate()
        .filter(|(_, address)| *address == operator)
        .map(|(position, _)| position as MemberIndex + 1)
        .collect()
}

/// Sender-side membership check installed as the broadcast channel filter.
/// A message is accepted only when the sender's operator address belongs to
/// the selected group.
#[derive(Clone, Debug)]
pub struct MembershipValidator {
    addresses: HashSet<ChainAddress>,
}

impl MembershipValidator {
    pub fn new(selected_operators: &[OperatorAddress]) -> Self {
        Self { addresses: selected_operators.iter().cloned().collect() }
    }

    pub fn is_in_group(&self, public_key: &PublicKey) -> bool {
        self.addresses.contains(&operator_address_from_public_key(public_key))
    }

    pub fn is_address_in_group(&self, address: &ChainAddress) -> bool {
        self.addresses.contains(address)
    }
}
