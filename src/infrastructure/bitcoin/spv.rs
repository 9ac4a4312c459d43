//! SPV proof assembly: block headers spanning the required number of
//! confirmations plus the Merkle branch from the transaction to the first
//! header's Merkle root.

use crate::foundation::{BridgeError, Result};
use crate::infrastructure::bitcoin::BitcoinChain;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Transaction, TxMerkleNode, Txid};
use serde::{Deserialize, Serialize};

/// Proof that convinces an on-chain verifier a Bitcoin transaction was
/// confirmed: concatenated 80-byte block headers and the Merkle branch
/// with the transaction's index in its block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpvProof {
    pub bitcoin_headers: Vec<u8>,
    pub merkle_proof: Vec<u8>,
    pub tx_index_in_block: u32,
}

/// Merkle branch of a transaction inside one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionMerkleProof {
    pub block_height: u64,
    pub merkle_nodes: Vec<sha256d::Hash>,
    pub position: u32,
}

/// Folds a Merkle branch up to the root. At each level the bit of
/// `position` decides whether the running hash is the left or the right
/// child.
pub fn merkle_root_from_branch(txid: &Txid, merkle_nodes: &[sha256d::Hash], position: u32) -> TxMerkleNode {
    let mut current = txid.to_raw_hash();
    let mut position = position;

    for node in merkle_nodes {
        let mut concat = Vec::with_capacity(64);
        if position & 1 == 1 {
            concat.extend_from_slice(node.as_byte_array());
            concat.extend_from_slice(current.as_byte_array());
        } else {
            concat.extend_from_slice(current.as_byte_array());
            concat.extend_from_slice(node.as_byte_array());
        }
        current = sha256d::Hash::hash(&concat);
        position >>= 1;
    }

    TxMerkleNode::from_raw_hash(current)
}

/// Computes a block's Merkle root and the branch of the transaction at
/// `position`, the way Bitcoin does it: odd nodes at a level are paired
/// with themselves.
pub(crate) fn merkle_branch(txids: &[Txid], position: usize) -> (TxMerkleNode, Vec<sha256d::Hash>) {
    let mut level: Vec<sha256d::Hash> = txids.iter().map(|txid| txid.to_raw_hash()).collect();
    let mut branch = Vec::new();
    let mut index = position;

    while level.len() > 1 {
        let sibling = if index % 2 == 0 { (index + 1).min(level.len() - 1) } else { index - 1 };
        branch.push(level[sibling]);

        let mut next_level = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut concat = Vec::with_capacity(64);
            concat.extend_from_slice(left.as_byte_array());
            concat.extend_from_slice(right.as_byte_array());
            next_level.push(sha256d::Hash::hash(&concat));
        }

        level = next_level;
        index /= 2;
    }

    (TxMerkleNode::from_raw_hash(level[0]), branch)
}

/// Assembles an SPV proof of the given transaction with the required number
/// of confirmations. Fails when the transaction does not have enough
/// confirmations yet or when the fetched Merkle branch does not connect the
/// transaction to its block header.
pub async fn assemble_spv_proof(
    transaction_hash: &Txid,
    required_confirmations: u64,
    btc_chain: &dyn BitcoinChain,
) -> Result<(Transaction, SpvProof)> {
    if required_confirmations == 0 {
        return Err(BridgeError::bitcoin("assemble_spv_proof", "required confirmations must be positive"));
    }

    let transaction = btc_chain.get_transaction(transaction_hash).await?;

    let confirmations = btc_chain.get_transaction_confirmations(transaction_hash).await?;
    if confirmations < required_confirmations {
        return Err(BridgeError::bitcoin(
            "assemble_spv_proof",
            format!("transaction has {} confirmations, {} required", confirmations, required_confirmations),
        ));
    }

    let latest_block_height = btc_chain.get_latest_block_height().await?;
    let block_height = latest_block_height - confirmations + 1;

    let merkle = btc_chain.get_transaction_merkle_proof(transaction_hash, block_height).await?;

    let mut bitcoin_headers = Vec::with_capacity(required_confirmations as usize * 80);
    for height in block_height..block_height + required_confirmations {
        let header = btc_chain.get_block_header(height).await?;

        if height == block_height {
            let root = merkle_root_from_branch(transaction_hash, &merkle.merkle_nodes, merkle.position);
            if root != header.merkle_root {
                return Err(BridgeError::bitcoin(
                    "assemble_spv_proof",
                    "merkle branch does not connect the transaction to its block header",
                ));
            }
        }

        bitcoin_headers.extend_from_slice(&serialize(&header));
    }

    let mut merkle_proof = Vec::with_capacity(merkle.merkle_nodes.len() * 32);
    for node in &merkle.merkle_nodes {
        merkle_proof.extend_from_slice(node.as_byte_array());
    }

    Ok((transaction, SpvProof { bitcoin_headers, merkle_proof, tx_index_in_block: merkle.position }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    #[test]
    fn single_transaction_block_has_empty_branch() {
        let (root, branch) = merkle_branch(&[txid(1)], 0);
        assert!(branch.is_empty());
        assert_eq!(root, merkle_root_from_branch(&txid(1), &branch, 0));
    }

    #[test]
    fn branch_connects_every_position_to_the_root() {
        let txids: Vec<Txid> = (1..=5).map(txid).collect();
        for position in 0..txids.len() {
            let (root, branch) = merkle_branch(&txids, position);
            assert_eq!(
                root,
                merkle_root_from_branch(&txids[position], &branch, position as u32),
                "branch of position {} must fold to the root",
                position
            );
        }
    }

    #[test]
    fn branch_of_wrong_transaction_does_not_connect() {
        let txids: Vec<Txid> = (1..=4).map(txid).collect();
        let (root, branch) = merkle_branch(&txids, 2);
        assert_ne!(root, merkle_root_from_branch(&txid(9), &branch, 2));
    }
}
