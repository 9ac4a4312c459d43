//! Moved funds sweep action: a target wallet merges an output received from
//! a moving-funds transaction into its own main UTXO.

use crate::application::actions::{
    advance_action, determine_wallet_main_utxo, WalletSigningExecutor, WalletTransactionExecutor,
};
use crate::domain::redemption::UnsignedBitcoinTransaction;
use crate::domain::wallet::{wallet_p2wpkh_script, ActionState, MovedFundsSweepProposal, Signer, UnspentTransactionOutput};
use crate::foundation::{BridgeError, Result};
use crate::infrastructure::bitcoin::BitcoinChain;
use crate::infrastructure::chain::Chain;
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use log::info;
use secp256k1::PublicKey;
use std::sync::Arc;
use std::time::Duration;

const MOVED_FUNDS_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS: u64 = 300;
const MOVED_FUNDS_SWEEP_BROADCAST_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const MOVED_FUNDS_SWEEP_BROADCAST_CHECK_DELAY: Duration = Duration::from_secs(60);

pub struct MovedFundsSweepAction {
    chain: Arc<dyn Chain>,
    btc_chain: Arc<dyn BitcoinChain>,
    wallet: Signer,
    wallet_public_key: PublicKey,
    signing_executor: Arc<dyn WalletSigningExecutor>,
    proposal: MovedFundsSweepProposal,
    proposal_processing_start_block: u64,
    proposal_expiry_block: u64,
}

impl MovedFundsSweepAction {
    pub fn new(
        chain: Arc<dyn Chain>,
        btc_chain: Arc<dyn BitcoinChain>,
        wallet: Signer,
        signing_executor: Arc<dyn WalletSigningExecutor>,
        proposal: MovedFundsSweepProposal,
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
        })
    }

    pub async fn execute(&self) -> Result<Transaction> {
        let wallet_id = self.wallet.wallet_id()?;
        let mut state = ActionState::Proposed;

        let moving_funds_transaction = self.btc_chain.get_transaction(&self.proposal.moving_funds_tx_hash).await?;
        let moved_value = moving_funds_transaction
            .output
            .get(self.proposal.moving_funds_tx_output_index as usize)
            .map(|output| output.value.to_sat())
            .ok_or_else(|| BridgeError::ProposalInvalid("moved funds output does not exist".to_string()))?;
        let moved_utxo = UnspentTransactionOutput::new(
            self.proposal.moving_funds_tx_hash,
            self.proposal.moving_funds_tx_output_index,
            moved_value,
        );

        let main_utxo = determine_wallet_main_utxo(&wallet_id, self.chain.as_ref(), self.btc_chain.as_ref()).await?;
        advance_action(&wallet_id, &mut state, ActionState::Validated);

        let mut inputs = vec![moved_utxo];
        if let Some(main_utxo) = main_utxo {
            inputs.push(main_utxo);
        }
        let unsigned = assemble_moved_funds_sweep_transaction(&self.wallet_public_key, &inputs, self.proposal.sweep_tx_fee)?;
        advance_action(&wallet_id, &mut state, ActionState::Assembled);

        if self.proposal_expiry_block < MOVED_FUNDS_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS {
            return Err(BridgeError::InvalidProposalExpiry {
                expiry_block: self.proposal_expiry_block,
                safety_margin: MOVED_FUNDS_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            });
        }

        let executor = WalletTransactionExecutor::new(self.btc_chain.as_ref(), &self.wallet, self.signing_executor.as_ref());

        let transaction = executor
            .sign_transaction(
                &unsigned,
                self.proposal_processing_start_block,
                self.proposal_expiry_block - MOVED_FUNDS_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            )
            .await?;
        advance_action(&wallet_id, &mut state, ActionState::Signed);

        executor
            .broadcast_transaction(&transaction, MOVED_FUNDS_SWEEP_BROADCAST_TIMEOUT, MOVED_FUNDS_SWEEP_BROADCAST_CHECK_DELAY)
            .await?;
        advance_action(&wallet_id, &mut state, ActionState::Broadcast);
        advance_action(&wallet_id, &mut state, ActionState::Confirmed);

        info!("wallet={} moved funds sweep transaction [{}]", wallet_id, transaction.compute_txid());
        Ok(transaction)
    }
}

fn assemble_moved_funds_sweep_transaction(
    wallet_public_key: &PublicKey,
    inputs: &[UnspentTransactionOutput],
    fee: u64,
) -> Result<UnsignedBitcoinTransaction> {
    let input_values: Vec<u64> = inputs.iter().map(|input| input.value).collect();
    let total: u64 = input_values.iter().sum();
    let output_value = total
        .checked_sub(fee)
        .filter(|value| *value > 0)
        .ok_or_else(|| BridgeError::ProposalInvalid("sweep inputs do not cover the fee".to_string()))?;

    let transaction = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|input| TxIn {
                previous_output: input.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value: Amount::from_sat(output_value),
            script_pubkey: wallet_p2wpkh_script(wallet_public_key),
        }],
    };

    Ok(UnsignedBitcoinTransaction { transaction, input_values })
}
