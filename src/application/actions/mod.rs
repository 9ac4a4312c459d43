//! Wallet action execution: shared plumbing for validating coordinator
//! proposals, correlating the wallet's main UTXO, threshold signing under a
//! deadline, and broadcasting with a confirmation check.

mod deposit_sweep;
mod heartbeat;
mod moved_funds_sweep;
mod moving_funds;
mod redemption;

pub use deposit_sweep::{assemble_deposit_sweep_transaction, DepositSweepAction};
pub use heartbeat::HeartbeatAction;
pub use moved_funds_sweep::MovedFundsSweepAction;
pub use moving_funds::{assemble_moving_funds_transaction, MovingFundsAction};
pub use redemption::{validate_redemption_proposal, RedemptionAction};

use crate::domain::redemption::UnsignedBitcoinTransaction;
use crate::domain::wallet::{ActionState, Signer, UnspentTransactionOutput};
use crate::foundation::{BridgeError, Result, WalletId};
use crate::infrastructure::bitcoin::{script_pays_to_public_key_hash, BitcoinChain};
use crate::infrastructure::chain::Chain;
use async_trait::async_trait;
use bitcoin::Transaction;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::{sleep, Instant};

/// Threshold-signing backend of a wallet. The signing math lives outside
/// this crate; the executor drives it under a block deadline.
#[async_trait]
pub trait WalletSigningExecutor: Send + Sync {
    async fn sign_transaction(
        &self,
        signer: &Signer,
        unsigned: &UnsignedBitcoinTransaction,
        signing_start_block: u64,
        signing_timeout_block: u64,
    ) -> Result<Transaction>;

    async fn sign_message(
        &self,
        signer: &Signer,
        message: &[u8],
        signing_start_block: u64,
        signing_timeout_block: u64,
    ) -> Result<Vec<u8>>;
}

/// Local guard complementing the on-chain wallet lock: at most one action
/// executes per wallet inside this process.
pub struct WalletActionsDispatcher {
    executing: Arc<Mutex<HashSet<WalletId>>>,
}

impl WalletActionsDispatcher {
    pub fn new() -> Self {
        Self { executing: Arc::new(Mutex::new(HashSet::new())) }
    }

    pub fn try_begin(&self, wallet_id: WalletId) -> Option<ActionGuard> {
        let mut executing = self.executing.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !executing.insert(wallet_id) {
            return None;
        }
        Some(ActionGuard { wallet_id, executing: self.executing.clone() })
    }
}

impl Default for WalletActionsDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ActionGuard {
    wallet_id: WalletId,
    executing: Arc<Mutex<HashSet<WalletId>>>,
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        self.executing.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(&self.wallet_id);
    }
}

/// Logs and checks an action's state transition.
pub(crate) fn advance_action(wallet_id: &WalletId, state: &mut ActionState, target: ActionState) {
    debug_assert!(state.can_transition_to(target), "invalid action transition {:?} -> {:?}", state, target);
    debug!("wallet={} action state {:?} -> {:?}", wallet_id, state, target);
    *state = target;
}

/// Correlates the on-chain main UTXO hash with the wallet's recent Bitcoin
/// transactions. Returns `None` when the wallet has no main UTXO committed,
/// an error when the committed hash cannot be correlated with any output.
pub async fn determine_wallet_main_utxo(
    wallet_id: &WalletId,
    chain: &dyn Chain,
    btc_chain: &dyn BitcoinChain,
) -> Result<Option<UnspentTransactionOutput>> {
    let wallet = chain.get_wallet(wallet_id).await?;

    if wallet.main_utxo_hash == [0u8; 32] {
        return Ok(None);
    }

    // Newest transactions first; the main UTXO is the latest output the
    // wallet received.
    let transactions = btc_chain.get_transactions_for_public_key_hash(wallet_id.as_bytes(), 5).await?;

    for transaction in transactions {
        let txid = transaction.compute_txid();
        for (vout, output) in transaction.output.iter().enumerate() {
            if !script_pays_to_public_key_hash(&output.script_pubkey, wallet_id.as_bytes()) {
                continue;
            }
            let candidate = UnspentTransactionOutput::new(txid, vout as u32, output.value.to_sat());
            let candidate_hash = chain.compute_main_utxo_hash(&candidate);
            if bool::from(candidate_hash.ct_eq(&wallet.main_utxo_hash)) {
                return Ok(Some(candidate));
            }
        }
    }

    Err(BridgeError::MainUtxoNotFound)
}

/// Verifies the wallet state is consistent between the host chain and
/// Bitcoin: the committed main UTXO hash matches the determined UTXO and
/// Bitcoin confirms that outpoint.
pub async fn ensure_wallet_synced_between_chains(
    wallet_id: &WalletId,
    main_utxo: &UnspentTransactionOutput,
    chain: &dyn Chain,
    btc_chain: &dyn BitcoinChain,
) -> Result<()> {
    let wallet = chain.get_wallet(wallet_id).await?;

    let expected_hash = chain.compute_main_utxo_hash(main_utxo);
    if !bool::from(expected_hash.ct_eq(&wallet.main_utxo_hash)) {
        return Err(BridgeError::WalletNotSynced("on-chain main UTXO hash differs from the determined UTXO".to_string()));
    }

    let funding_transaction = btc_chain
        .get_transaction(&main_utxo.outpoint.txid)
        .await
        .map_err(|err| BridgeError::WalletNotSynced(format!("main UTXO transaction unknown to Bitcoin: {}", err)))?;

    let output_matches = funding_transaction
        .output
        .get(main_utxo.outpoint.vout as usize)
        .map(|output| output.value.to_sat() == main_utxo.value)
        .unwrap_or(false);
    if !output_matches {
        return Err(BridgeError::WalletNotSynced("main UTXO outpoint not confirmed by Bitcoin".to_string()));
    }

    Ok(())
}

/// Signs and broadcasts wallet transactions.
pub struct WalletTransactionExecutor<'a> {
    btc_chain: &'a dyn BitcoinChain,
    wallet: &'a Signer,
    signing_executor: &'a dyn WalletSigningExecutor,
}

impl<'a> WalletTransactionExecutor<'a> {
    pub fn new(btc_chain: &'a dyn BitcoinChain, wallet: &'a Signer, signing_executor: &'a dyn WalletSigningExecutor) -> Self {
        Self { btc_chain, wallet, signing_executor }
    }

    pub async fn sign_transaction(
        &self,
        unsigned: &UnsignedBitcoinTransaction,
        signing_start_block: u64,
        signing_timeout_block: u64,
    ) -> Result<Transaction> {
        if signing_timeout_block <= signing_start_block {
            return Err(BridgeError::SigningFailed(format!(
                "signing timeout block {} not after start block {}",
                signing_timeout_block, signing_start_block,
            )));
        }
        self.signing_executor.sign_transaction(self.wallet, unsigned, signing_start_block, signing_timeout_block).await
    }

    /// Broadcasts the transaction and keeps re-broadcasting until it is
    /// known on the Bitcoin chain or the timeout elapses. The check delay
    /// between attempts gives the transaction time to propagate.
    pub async fn broadcast_transaction(
        &self,
        transaction: &Transaction,
        timeout: Duration,
        check_delay: Duration,
    ) -> Result<()> {
        let txid = transaction.compute_txid();
        let deadline = Instant::now() + timeout;

        loop {
            if self.btc_chain.get_transaction_confirmations(&txid).await.is_ok() {
                info!("transaction [{}] is known on the Bitcoin chain", txid);
                return Ok(());
            }

            if Instant::now() >= deadline {
                break;
            }

            match self.btc_chain.broadcast_transaction(transaction).await {
                Ok(()) => debug!("transaction [{}] broadcast attempted", txid),
                Err(err) => warn!("transaction [{}] broadcast failed: {}", txid, err),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(check_delay.min(remaining)).await;
        }

        if self.btc_chain.get_transaction_confirmations(&txid).await.is_ok() {
            info!("transaction [{}] is known on the Bitcoin chain", txid);
            return Ok(());
        }

        Err(BridgeError::BroadcastTimeout(txid.to_string()))
    }
}
