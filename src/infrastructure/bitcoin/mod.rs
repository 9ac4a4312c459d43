//! Bitcoin chain facade: transaction queries, broadcast, fee estimation,
//! and the data needed to assemble SPV proofs.

mod local;
mod spv;

pub use local::LocalBitcoin;
pub use spv::{assemble_spv_proof, merkle_root_from_branch, SpvProof, TransactionMerkleProof};

use crate::foundation::{Hash20, Result};
use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::{Script, Transaction, Txid};

/// The interface the node expects to interact with the Bitcoin chain on.
#[async_trait]
pub trait BitcoinChain: Send + Sync {
    /// Fetches a transaction known to the chain, confirmed or mempool.
    async fn get_transaction(&self, hash: &Txid) -> Result<Transaction>;

    /// Number of confirmations of the given transaction; zero for a mempool
    /// transaction, an error for an unknown one.
    async fn get_transaction_confirmations(&self, hash: &Txid) -> Result<u64>;

    /// Confirmed transactions paying to the given public key hash, newest
    /// first, at most `limit` of them.
    async fn get_transactions_for_public_key_hash(
        &self,
        public_key_hash: &Hash20,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<()>;

    /// Fee estimate in satoshi per virtual byte for confirmation within the
    /// given number of blocks.
    async fn estimate_sat_per_vbyte_fee(&self, blocks: u64) -> Result<u64>;

    async fn get_latest_block_height(&self) -> Result<u64>;

    async fn get_block_header(&self, height: u64) -> Result<Header>;

    /// Merkle branch connecting the transaction to the Merkle root of the
    /// block at the given height.
    async fn get_transaction_merkle_proof(&self, hash: &Txid, block_height: u64) -> Result<TransactionMerkleProof>;
}

/// Whether the script pays to the given 20-byte public key hash, either as
/// P2WPKH or legacy P2PKH.
pub fn script_pays_to_public_key_hash(script: &Script, public_key_hash: &Hash20) -> bool {
    let bytes = script.as_bytes();
    if script.is_p2wpkh() {
        return &bytes[2..22] == public_key_hash;
    }
    if script.is_p2pkh() {
        return &bytes[3..23] == public_key_hash;
    }
    false
}
