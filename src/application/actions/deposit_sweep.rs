//! Deposit sweep action: consolidates revealed deposits (and the optional
//! current main UTXO) into a single new main UTXO of the wallet.

use crate::application::actions::{
    advance_action, determine_wallet_main_utxo, WalletSigningExecutor, WalletTransactionExecutor,
};
use crate::domain::redemption::UnsignedBitcoinTransaction;
use crate::domain::wallet::{wallet_p2wpkh_script, ActionState, DepositSweepProposal, Signer, UnspentTransactionOutput};
use crate::foundation::{BridgeError, Result, DEPOSIT_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS};
use crate::infrastructure::bitcoin::BitcoinChain;
use crate::infrastructure::chain::Chain;
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use log::info;
use secp256k1::PublicKey;
use std::sync::Arc;
use std::time::Duration;

const DEPOSIT_SWEEP_BROADCAST_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DEPOSIT_SWEEP_BROADCAST_CHECK_DELAY: Duration = Duration::from_secs(60);

pub struct DepositSweepAction {
    chain: Arc<dyn Chain>,
    btc_chain: Arc<dyn BitcoinChain>,
    wallet: Signer,
    wallet_public_key: PublicKey,
    signing_executor: Arc<dyn WalletSigningExecutor>,
    proposal: DepositSweepProposal,
    proposal_processing_start_block: u64,
    proposal_expiry_block: u64,
    broadcast_timeout: Duration,
    broadcast_check_delay: Duration,
}

impl DepositSweepAction {
    pub fn new(
        chain: Arc<dyn Chain>,
        btc_chain: Arc<dyn BitcoinChain>,
        wallet: Signer,
        signing_executor: Arc<dyn WalletSigningExecutor>,
        proposal: DepositSweepProposal,
        proposal_processing_start_block: u64,
        proposal_expiry_block: u64,
    ) -> Result<Self> {
        let wallet_public_key = PublicKey::from_slice(&wallet.wallet_public_key)?;
        Ok(Self {
            chain,
            btc_chain,
            wallet,
            wallet_public_key,
            signing_executor,
            proposal,
            proposal_processing_start_block,
            proposal_expiry_block,
            broadcast_timeout: DEPOSIT_SWEEP_BROADCAST_TIMEOUT,
            broadcast_check_delay: DEPOSIT_SWEEP_BROADCAST_CHECK_DELAY,
        })
    }

    pub fn with_broadcast_timing(mut self, timeout: Duration, check_delay: Duration) -> Self {
        self.broadcast_timeout = timeout;
        self.broadcast_check_delay = check_delay;
        self
    }

    pub async fn execute(&self) -> Result<Transaction> {
        let wallet_id = self.wallet.wallet_id()?;
        let mut state = ActionState::Proposed;

        if self.proposal.deposits_keys.is_empty() {
            return Err(BridgeError::ProposalInvalid("sweep proposal names no deposits".to_string()));
        }

        // Every proposed deposit must be revealed and still unswept.
        let mut deposit_utxos = Vec::with_capacity(self.proposal.deposits_keys.len());
        for key in &self.proposal.deposits_keys {
            let deposit = self.chain.deposits(&key.funding_tx_hash, key.funding_output_index).await?;
            if !deposit.is_revealed() {
                return Err(BridgeError::ProposalInvalid(format!(
                    "deposit {}:{} is not revealed",
                    key.funding_tx_hash, key.funding_output_index,
                )));
            }
            if deposit.is_swept() {
                return Err(BridgeError::ProposalInvalid(format!(
                    "deposit {}:{} is already swept",
                    key.funding_tx_hash, key.funding_output_index,
                )));
            }

            let funding_transaction = self.btc_chain.get_transaction(&key.funding_tx_hash).await?;
            let value = funding_transaction
                .output
                .get(key.funding_output_index as usize)
                .map(|output| output.value.to_sat())
                .ok_or_else(|| BridgeError::ProposalInvalid("deposit funding output does not exist".to_string()))?;
            deposit_utxos.push(UnspentTransactionOutput::new(key.funding_tx_hash, key.funding_output_index, value));
        }

        let main_utxo = determine_wallet_main_utxo(&wallet_id, self.chain.as_ref(), self.btc_chain.as_ref()).await?;
        advance_action(&wallet_id, &mut state, ActionState::Validated);

        let unsigned =
            assemble_deposit_sweep_transaction(&self.wallet_public_key, main_utxo, &deposit_utxos, self.proposal.sweep_tx_fee)?;
        advance_action(&wallet_id, &mut state, ActionState::Assembled);

        if self.proposal_expiry_block < DEPOSIT_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS {
            return Err(BridgeError::InvalidProposalExpiry {
                expiry_block: self.proposal_expiry_block,
                safety_margin: DEPOSIT_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            });
        }

        let executor = WalletTransactionExecutor::new(self.btc_chain.as_ref(), &self.wallet, self.signing_executor.as_ref());

        let transaction = executor
            .sign_transaction(
                &unsigned,
                self.proposal_processing_start_block,
                self.proposal_expiry_block - DEPOSIT_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            )
            .await?;
        advance_action(&wallet_id, &mut state, ActionState::Signed);

        executor.broadcast_transaction(&transaction, self.broadcast_timeout, self.broadcast_check_delay).await?;
        advance_action(&wallet_id, &mut state, ActionState::Broadcast);
        advance_action(&wallet_id, &mut state, ActionState::Confirmed);

        info!(
            "wallet={} deposit sweep transaction [{}] sweeps [{}] deposits",
            wallet_id,
            transaction.compute_txid(),
            deposit_utxos.len(),
        );
        Ok(transaction)
    }
}

/// Builds the unsigned sweep: the current main UTXO (when present) followed
/// by all deposit outpoints as inputs, one output carrying everything minus
/// the fee back to the wallet.
pub fn assemble_deposit_sweep_transaction(
    wallet_public_key: &PublicKey,
    main_utxo: Option<UnspentTransactionOutput>,
    deposit_utxos: &[UnspentTransactionOutput],
    fee: u64,
) -> Result<UnsignedBitcoinTransaction> {
    if deposit_utxos.is_empty() {
        return Err(BridgeError::ProposalInvalid("at least one deposit is required".to_string()));
    }

    let mut inputs = Vec::with_capacity(deposit_utxos.len() + 1);
    let mut input_values = Vec::with_capacity(deposit_utxos.len() + 1);

    let mut push_input = |outpoint: OutPoint, value: u64| {
        inputs.push(TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
        input_values.push(value);
    };

    if let Some(main_utxo) = main_utxo {
        push_input(main_utxo.outpoint, main_utxo.value);
    }
    for deposit in deposit_utxos {
        push_input(deposit.outpoint, deposit.value);
    }

    let total_input_value: u64 = input_values.iter().sum();
    let output_value = total_input_value
        .checked_sub(fee)
        .filter(|value| *value > 0)
        .ok_or_else(|| BridgeError::ProposalInvalid("sweep inputs do not cover the fee".to_string()))?;

    let transaction = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: inputs,
        output: vec![TxOut {
            value: Amount::from_sat(output_value),
            script_pubkey: wallet_p2wpkh_script(wallet_public_key),
        }],
    };

    Ok(UnsignedBitcoinTransaction { transaction, input_values })
}
