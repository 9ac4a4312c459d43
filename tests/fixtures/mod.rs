//! Shared fixtures for integration tests: stub protocol backends, a wired
//! node harness over the in-process chain/bitcoin/network facades, and
//! funding helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use std::sync::Arc;
use std::time::Duration;
use tideway::application::actions::WalletSigningExecutor;
use tideway::application::dkg::{DkgExecutionOutcome, DkgProtocol};
use tideway::application::node::Node;
use tideway::application::pool::Scheduler;
use tideway::domain::dkg::{DkgResult, EcdsaPreParams, GroupView};
use tideway::domain::group::GroupParameters;
use tideway::domain::redemption::UnsignedBitcoinTransaction;
use tideway::domain::wallet::{
    wallet_id_of, wallet_p2wpkh_script, Signer, UnspentTransactionOutput, WalletChainData, WalletState,
};
use tideway::foundation::{Hash32, MemberIndex, Result, WalletId};
use tideway::infrastructure::bitcoin::LocalBitcoin;
use tideway::infrastructure::chain::{main_utxo_hash, LocalChain, OperatorSigner, Signing};
use tideway::infrastructure::config::PreParamsConfig;
use tideway::infrastructure::network::{BroadcastChannel, LocalNetwork, LocalNetworkHub};
use tideway::infrastructure::storage::{MemoryPoolPersistence, MemorySignerStorage};
use tokio::sync::watch;

/// Protocol backend that deterministically "computes" the configured group
/// key. The execution ends a fixed number of blocks after the DKG start.
pub struct StubDkgProtocol {
    pub group_public_key: Vec<u8>,
    pub misbehaved: Vec<MemberIndex>,
    pub end_block_offset: u64,
}

impl StubDkgProtocol {
    pub fn new(group_public_key: Vec<u8>) -> Self {
        Self { group_public_key, misbehaved: Vec::new(), end_block_offset: 10 }
    }
}

#[async_trait]
impl DkgProtocol for StubDkgProtocol {
    async fn execute(
        &self,
        _seed: &Hash32,
        start_block: u64,
        _member_index: MemberIndex,
        group_parameters: &GroupParameters,
        _pre_params: EcdsaPreParams,
        _channel: Arc<dyn BroadcastChannel>,
    ) -> Result<DkgExecutionOutcome> {
        Ok(DkgExecutionOutcome {
            result: DkgResult {
                group_public_key: self.group_public_key.clone(),
                group: GroupView::new(group_parameters.group_size, self.misbehaved.iter().copied()),
                private_key_share: vec![0x5A; 32],
            },
            execution_end_block: start_block + self.end_block_offset,
        })
    }

    async fn generate_pre_params(&self, _cancel: watch::Receiver<bool>) -> Option<EcdsaPreParams> {
        Some(EcdsaPreParams { blob: rand::random::<[u8; 32]>().to_vec() })
    }
}

/// Signing backend that returns the transaction as-is; the local Bitcoin
/// chain does not verify witnesses.
pub struct StubSigningExecutor;

#[async_trait]
impl WalletSigningExecutor for StubSigningExecutor {
    async fn sign_transaction(
        &self,
        _signer: &Signer,
        unsigned: &UnsignedBitcoinTransaction,
        _signing_start_block: u64,
        _signing_timeout_block: u64,
    ) -> Result<Transaction> {
        Ok(unsigned.transaction.clone())
    }

    async fn sign_message(
        &self,
        _signer: &Signer,
        message: &[u8],
        _signing_start_block: u64,
        _signing_timeout_block: u64,
    ) -> Result<Vec<u8>> {
        Ok(message.to_vec())
    }
}

pub struct NodeHarness {
    pub operator: Arc<OperatorSigner>,
    pub chain: Arc<LocalChain>,
    pub btc: Arc<LocalBitcoin>,
    pub node: Arc<Node>,
    pub scheduler: Arc<Scheduler>,
    shutdown: watch::Sender<bool>,
}

impl NodeHarness {
    pub async fn start(group_parameters: GroupParameters, protocol: Arc<dyn DkgProtocol>) -> Self {
        let operator = Arc::new(OperatorSigner::generate());
        let chain = Arc::new(LocalChain::new(operator.clone(), group_parameters));
        let btc = Arc::new(LocalBitcoin::new());
        let network = Arc::new(LocalNetwork::new(LocalNetworkHub::new(), operator.clone()));
        let scheduler = Scheduler::new();

        let pre_params_config =
            PreParamsConfig { pool_size: 8, generation_timeout_secs: 10, generation_delay_millis: 0 };

        let node = Node::new(
            chain.clone(),
            btc.clone(),
            network,
            Arc::new(MemorySignerStorage::new()),
            Arc::new(MemoryPoolPersistence::new()),
            scheduler.clone(),
            protocol,
            Arc::new(StubSigningExecutor),
            &pre_params_config,
        )
        .expect("node");

        let (shutdown, shutdown_signal) = watch::channel(false);
        tokio::spawn(node.clone().run(shutdown_signal));

        Self { operator, chain, btc, node, scheduler, shutdown }
    }

    /// Waits until the pre-params pool can feed the given number of
    /// concurrent protocol executions.
    pub async fn wait_for_pre_params(&self, count: usize) {
        wait_until(Duration::from_secs(5), || self.node.pre_params_pool().current_size() >= count).await;
    }

    /// Advances the local chain one block at a time until the condition
    /// holds or `max_block` is reached.
    pub async fn advance_blocks_until(&self, max_block: u64, condition: impl Fn() -> bool) -> bool {
        loop {
            if condition() {
                return true;
            }
            let current = self.chain.current_block();
            if current >= max_block {
                return condition();
            }
            self.chain.set_current_block(current + 1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn stop(&self) {
        self.scheduler.stop();
        let _ = self.shutdown.send(true);
    }
}

/// Polls the condition until it holds, panicking after the timeout.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn fresh_public_key() -> secp256k1::PublicKey {
    OperatorSigner::generate().public_key()
}

/// A transaction spending the given outpoints into the given outputs. The
/// local Bitcoin chain does not validate inputs.
pub fn build_transaction(spends: &[(Txid, u32)], outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: spends
            .iter()
            .map(|(txid, vout)| TxIn {
                previous_output: OutPoint { txid: *txid, vout: *vout },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

/// Funds the wallet on the local Bitcoin chain and commits the resulting
/// main UTXO on the local host chain, leaving the wallet Live.
pub fn fund_wallet(
    chain: &LocalChain,
    btc: &LocalBitcoin,
    wallet_public_key: &secp256k1::PublicKey,
    value: u64,
) -> (WalletId, UnspentTransactionOutput) {
    let funding = build_transaction(
        &[(Txid::from_byte_array([0xF0; 32]), 0)],
        vec![TxOut { value: Amount::from_sat(value), script_pubkey: wallet_p2wpkh_script(wallet_public_key) }],
    );
    let utxo = UnspentTransactionOutput::new(funding.compute_txid(), 0, value);
    btc.mine_block(vec![funding]);

    let wallet_id = wallet_id_of(wallet_public_key);
    chain.set_wallet(
        wallet_id,
        WalletChainData {
            public_key: *wallet_public_key,
            state: WalletState::Live,
            main_utxo_hash: main_utxo_hash(&utxo),
            pending_redemptions_value: 0,
            pending_moved_funds_sweep_requests_count: 0,
            moving_funds_target_wallets_commitment_hash: [0u8; 32],
        },
    );

    (wallet_id, utxo)
}

/// A signer as it would have been registered after a successful DKG.
pub fn wallet_signer(operator: &OperatorSigner, wallet_public_key: &secp256k1::PublicKey, member_index: MemberIndex) -> Signer {
    Signer {
        wallet_public_key: wallet_public_key.serialize().to_vec(),
        signing_group_operators: vec![operator.address()],
        member_index,
        private_key_share: vec![0x11; 32],
    }
}
