//! Heartbeat action: the wallet proves liveness by threshold-signing a
//! fixed message. No Bitcoin transaction is produced.

use crate::application::actions::WalletSigningExecutor;
use crate::domain::wallet::{HeartbeatProposal, Signer};
use crate::foundation::{BridgeError, Result};
use crate::infrastructure::chain::Chain;
use log::info;
use std::sync::Arc;

/// Blocks reserved between the signing deadline and the proposal expiry so
/// a late signature cannot leak outside the validity window.
const HEARTBEAT_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS: u64 = 100;

pub struct HeartbeatAction {
    chain: Arc<dyn Chain>,
    wallet: Signer,
    signing_executor: Arc<dyn WalletSigningExecutor>,
    proposal: HeartbeatProposal,
    proposal_processing_start_block: u64,
    proposal_expiry_block: u64,
}

impl HeartbeatAction {
    pub fn new(
        chain: Arc<dyn Chain>,
        wallet: Signer,
        signing_executor: Arc<dyn WalletSigningExecutor>,
        proposal: HeartbeatProposal,
        proposal_processing_start_block: u64,
        proposal_expiry_block: u64,
    ) -> Self {
        Self { chain, wallet, signing_executor, proposal, proposal_processing_start_block, proposal_expiry_block }
    }

    pub async fn execute(&self) -> Result<Vec<u8>> {
        let wallet_id = self.wallet.wallet_id()?;
        let _ = self.chain.get_wallet(&wallet_id).await?;

        if self.proposal_expiry_block < HEARTBEAT_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS {
            return Err(BridgeError::InvalidProposalExpiry {
                expiry_block: self.proposal_expiry_block,
                safety_margin: HEARTBEAT_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            });
        }

        let signature = self
            .signing_executor
            .sign_message(
                &self.wallet,
                &self.proposal.message,
                self.proposal_processing_start_block,
                self.proposal_expiry_block - HEARTBEAT_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            )
            .await?;

        info!("wallet={} heartbeat signed over message [0x{}]", wallet_id, hex::encode(self.proposal.message));
        Ok(signature)
    }
}
