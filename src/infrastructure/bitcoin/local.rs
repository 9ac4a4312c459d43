//! In-process Bitcoin chain used by tests: blocks are mined explicitly and
//! broadcast transactions land in a local mempool.

use crate::foundation::{BridgeError, Hash20, Result};
use crate::infrastructure::bitcoin::spv::merkle_branch;
use crate::infrastructure::bitcoin::{script_pays_to_public_key_hash, BitcoinChain, TransactionMerkleProof};
use async_trait::async_trait;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use bitcoin::{BlockHash, Transaction, Txid};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

struct LocalBlock {
    header: Header,
    transactions: Vec<Transaction>,
}

struct LocalBitcoinState {
    blocks: BTreeMap<u64, LocalBlock>,
    mempool: Vec<Transaction>,
    broadcast_log: Vec<Txid>,
    fee_rate: u64,
}

pub struct LocalBitcoin {
    state: Mutex<LocalBitcoinState>,
}

impl Default for LocalBitcoin {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBitcoin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LocalBitcoinState {
                blocks: BTreeMap::new(),
                mempool: Vec::new(),
                broadcast_log: Vec::new(),
                fee_rate: 1,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LocalBitcoinState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mines the next block containing the given transactions and returns
    /// its height.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> u64 {
        let mut state = self.lock_state();

        let (height, prev_blockhash) = match state.blocks.iter().next_back() {
            Some((height, block)) => (height + 1, block.header.block_hash()),
            None => (1, BlockHash::all_zeros()),
        };

        let txids: Vec<Txid> = transactions.iter().map(|tx| tx.compute_txid()).collect();
        let merkle_root = if txids.is_empty() {
            bitcoin::TxMerkleNode::all_zeros()
        } else {
            merkle_branch(&txids, 0).0
        };

        let header = Header {
            version: Version::ONE,
            prev_blockhash,
            merkle_root,
            time: height as u32,
            bits: CompactTarget::from_consensus(0x1d00_ffff),
            nonce: 0,
        };

        // Mined transactions leave the mempool.
        state.mempool.retain(|tx| !txids.contains(&tx.compute_txid()));
        state.blocks.insert(height, LocalBlock { header, transactions });
        height
    }

    /// Mines `count` empty blocks, burying the current tip.
    pub fn mine_empty_blocks(&self, count: u64) {
        for _ in 0..count {
            self.mine_block(Vec::new());
        }
    }

    pub fn set_fee_rate(&self, sat_per_vbyte: u64) {
        self.lock_state().fee_rate = sat_per_vbyte;
    }

    pub fn broadcast_log(&self) -> Vec<Txid> {
        self.lock_state().broadcast_log.clone()
    }

    fn find_transaction(state: &LocalBitcoinState, hash: &Txid) -> Option<(Option<u64>, Transaction)> {
        for (height, block) in &state.blocks {
            for transaction in &block.transactions {
                if transaction.compute_txid() == *hash {
                    return Some((Some(*height), transaction.clone()));
                }
            }
        }
        state
            .mempool
            .iter()
            .find(|transaction| transaction.compute_txid() == *hash)
            .map(|transaction| (None, transaction.clone()))
    }

    fn tip(state: &LocalBitcoinState) -> u64 {
        state.blocks.keys().next_back().copied().unwrap_or(0)
    }
}

#[async_trait]
impl BitcoinChain for LocalBitcoin {
    async fn get_transaction(&self, hash: &Txid) -> Result<Transaction> {
        let state = self.lock_state();
        Self::find_transaction(&state, hash)
            .map(|(_, transaction)| transaction)
            .ok_or_else(|| BridgeError::bitcoin("get_transaction", format!("unknown transaction {}", hash)))
    }

    async fn get_transaction_confirmations(&self, hash: &Txid) -> Result<u64> {
        let state = self.lock_state();
        match Self::find_transaction(&state, hash) {
            Some((Some(height), _)) => Ok(Self::tip(&state) - height + 1),
            Some((None, _)) => Ok(0),
            None => Err(BridgeError::bitcoin("get_transaction_confirmations", format!("unknown transaction {}", hash))),
        }
    }

    async fn get_transactions_for_public_key_hash(
        &self,
        public_key_hash: &Hash20,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let state = self.lock_state();
        let mut matches = Vec::new();

        for (_, block) in state.blocks.iter().rev() {
            for transaction in &block.transactions {
                let pays_wallet = transaction
                    .output
                    .iter()
                    .any(|output| script_pays_to_public_key_hash(&output.script_pubkey, public_key_hash));
                if pays_wallet {
                    matches.push(transaction.clone());
                    if matches.len() == limit {
                        return Ok(matches);
                    }
                }
            }
        }

        Ok(matches)
    }

    async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<()> {
        let mut state = self.lock_state();
        let txid = transaction.compute_txid();
        state.broadcast_log.push(txid);
        if Self::find_transaction(&state, &txid).is_none() {
            state.mempool.push(transaction.clone());
        }
        Ok(())
    }

    async fn estimate_sat_per_vbyte_fee(&self, _blocks: u64) -> Result<u64> {
        Ok(self.lock_state().fee_rate)
    }

    async fn get_latest_block_height(&self) -> Result<u64> {
        Ok(Self::tip(&self.lock_state()))
    }

    async fn get_block_header(&self, height: u64) -> Result<Header> {
        self.lock_state()
            .blocks
            .get(&height)
            .map(|block| block.header)
            .ok_or_else(|| BridgeError::bitcoin("get_block_header", format!("no block at height {}", height)))
    }

    async fn get_transaction_merkle_proof(&self, hash: &Txid, block_height: u64) -> Result<TransactionMerkleProof> {
        let state = self.lock_state();
        let block = state
            .blocks
            .get(&block_height)
            .ok_or_else(|| BridgeError::bitcoin("get_transaction_merkle_proof", format!("no block at height {}", block_height)))?;

        let txids: Vec<Txid> = block.transactions.iter().map(|tx| tx.compute_txid()).collect();
        let position = txids
            .iter()
            .position(|txid| txid == hash)
            .ok_or_else(|| BridgeError::bitcoin("get_transaction_merkle_proof", "transaction not in block"))?;

        let (_, merkle_nodes) = merkle_branch(&txids, position);
        Ok(TransactionMerkleProof { block_height, merkle_nodes, position: position as u32 })
    }
}
