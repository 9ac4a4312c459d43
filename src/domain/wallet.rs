//! Wallet model shared between the host-chain facade and the action
//! executors.

use crate::foundation::{
    ChainAddress, Hash32, MemberIndex, OperatorAddress, WalletId, DEPOSIT_SWEEP_PROPOSAL_VALIDITY_BLOCKS,
    HEARTBEAT_PROPOSAL_VALIDITY_BLOCKS, MOVED_FUNDS_SWEEP_PROPOSAL_VALIDITY_BLOCKS,
    MOVING_FUNDS_PROPOSAL_VALIDITY_BLOCKS, REDEMPTION_PROPOSAL_VALIDITY_BLOCKS,
};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::{OutPoint, ScriptBuf, Txid};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a wallet as registered on the host chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletState {
    Unknown,
    Live,
    MovingFunds,
    Closing,
    Closed,
    Terminated,
}

impl WalletState {
    pub fn can_transition_to(self, target: WalletState) -> bool {
        use WalletState::*;
        matches!(
            (self, target),
            (Live, MovingFunds)
                | (Live, Terminated)
                | (MovingFunds, Closing)
                | (MovingFunds, Terminated)
                | (Closing, Closed)
                | (Closing, Terminated)
        )
    }
}

/// Wallet data registered on the host chain.
#[derive(Clone, Debug)]
pub struct WalletChainData {
    pub public_key: PublicKey,
    pub state: WalletState,
    /// Hash of the wallet's current main UTXO, or zero when the wallet has
    /// no confirmed balance yet.
    pub main_utxo_hash: Hash32,
    pub pending_redemptions_value: u64,
    pub pending_moved_funds_sweep_requests_count: u32,
    pub moving_funds_target_wallets_commitment_hash: Hash32,
}

/// The single Bitcoin UTXO representing a wallet's on-chain balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnspentTransactionOutput {
    pub outpoint: OutPoint,
    pub value: u64,
}

impl UnspentTransactionOutput {
    pub fn new(txid: Txid, vout: u32, value: u64) -> Self {
        Self { outpoint: OutPoint { txid, vout }, value }
    }
}

/// Wallet identifier: HASH160 over the compressed wallet public key.
pub fn wallet_id_of(public_key: &PublicKey) -> WalletId {
    WalletId::new(hash160::Hash::hash(&public_key.serialize()).to_byte_array())
}

/// P2WPKH script locking funds to the wallet.
pub fn wallet_p2wpkh_script(public_key: &PublicKey) -> ScriptBuf {
    let compressed = bitcoin::CompressedPublicKey(*public_key);
    ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash())
}

/// Type tag of a wallet action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletActionType {
    Noop,
    Heartbeat,
    DepositSweep,
    Redemption,
    MovingFunds,
    MovedFundsSweep,
}

impl fmt::Display for WalletActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WalletActionType::Noop => "Noop",
            WalletActionType::Heartbeat => "Heartbeat",
            WalletActionType::DepositSweep => "DepositSweep",
            WalletActionType::Redemption => "Redemption",
            WalletActionType::MovingFunds => "MovingFunds",
            WalletActionType::MovedFundsSweep => "MovedFundsSweep",
        };
        write!(f, "{}", name)
    }
}

/// Lock held on-chain while a wallet executes a non-heartbeat action.
#[derive(Clone, Debug)]
pub struct WalletLock {
    pub expires_at: u64,
    pub cause: WalletActionType,
}

/// Progress of a wallet action through the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionState {
    Proposed,
    Validated,
    Assembled,
    Signed,
    Broadcast,
    Confirmed,
    Aborted,
}

impl ActionState {
    pub fn can_transition_to(self, target: ActionState) -> bool {
        use ActionState::*;
        if matches!(target, Aborted) {
            return !matches!(self, Confirmed | Aborted);
        }
        matches!(
            (self, target),
            (Proposed, Validated) | (Validated, Assembled) | (Assembled, Signed) | (Signed, Broadcast) | (Broadcast, Confirmed)
        )
    }
}

/// A proposal issued by the wallet's coordination leader. Every variant
/// carries the validity window during which the wallet is considered busy
/// with the proposed action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WalletActionProposal {
    Heartbeat(HeartbeatProposal),
    DepositSweep(DepositSweepProposal),
    Redemption(RedemptionProposal),
    MovingFunds(MovingFundsProposal),
    MovedFundsSweep(MovedFundsSweepProposal),
}

impl WalletActionProposal {
    pub fn action_type(&self) -> WalletActionType {
        match self {
            WalletActionProposal::Heartbeat(_) => WalletActionType::Heartbeat,
            WalletActionProposal::DepositSweep(_) => WalletActionType::DepositSweep,
            WalletActionProposal::Redemption(_) => WalletActionType::Redemption,
            WalletActionProposal::MovingFunds(_) => WalletActionType::MovingFunds,
            WalletActionProposal::MovedFundsSweep(_) => WalletActionType::MovedFundsSweep,
        }
    }

    pub fn validity_blocks(&self) -> u64 {
        match self {
            WalletActionProposal::Heartbeat(_) => HEARTBEAT_PROPOSAL_VALIDITY_BLOCKS,
            WalletActionProposal::DepositSweep(_) => DEPOSIT_SWEEP_PROPOSAL_VALIDITY_BLOCKS,
            WalletActionProposal::Redemption(_) => REDEMPTION_PROPOSAL_VALIDITY_BLOCKS,
            WalletActionProposal::MovingFunds(_) => MOVING_FUNDS_PROPOSAL_VALIDITY_BLOCKS,
            WalletActionProposal::MovedFundsSweep(_) => MOVED_FUNDS_SWEEP_PROPOSAL_VALIDITY_BLOCKS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatProposal {
    /// Fixed-size message the wallet proves liveness over.
    pub message: [u8; 16],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositKey {
    pub funding_tx_hash: Txid,
    pub funding_output_index: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepositSweepProposal {
    pub deposits_keys: Vec<DepositKey>,
    pub sweep_tx_fee: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedemptionProposal {
    pub redeemers_output_scripts: Vec<ScriptBuf>,
    pub redemption_tx_fee: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MovingFundsProposal {
    /// Public key hashes of the target wallets, sorted ascending.
    pub target_wallets: Vec<WalletId>,
    pub moving_funds_tx_fee: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MovedFundsSweepProposal {
    pub moving_funds_tx_hash: Txid,
    pub moving_funds_tx_output_index: u32,
    pub sweep_tx_fee: u64,
}

/// Deposit data registered on the host chain, addressed by funding outpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct DepositChainData {
    /// UNIX timestamp of the deposit reveal, zero when never revealed.
    pub revealed_at: u64,
    /// UNIX timestamp of the sweep that consumed this deposit, zero when
    /// unswept.
    pub swept_at: u64,
}

impl DepositChainData {
    pub fn is_revealed(&self) -> bool {
        self.revealed_at != 0
    }

    pub fn is_swept(&self) -> bool {
        self.swept_at != 0
    }
}

/// Per-wallet signing material owned by the wallet registry. The private key
/// share is an opaque blob interpreted only by the threshold-signing backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct Signer {
    pub wallet_public_key: Vec<u8>,
    pub signing_group_operators: Vec<OperatorAddress>,
    pub member_index: MemberIndex,
    pub private_key_share: Vec<u8>,
}

impl Signer {
    pub fn wallet_id(&self) -> crate::foundation::Result<WalletId> {
        let public_key = PublicKey::from_slice(&self.wallet_public_key)?;
        Ok(wallet_id_of(&public_key))
    }

    pub fn operator_of(&self, address: &ChainAddress) -> bool {
        self.signing_group_operators.iter().any(|operator| operator == address)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The key share never reaches logs.
        f.debug_struct("Signer")
            .field("wallet_public_key", &hex::encode(&self.wallet_public_key))
            .field("member_index", &self.member_index)
            .field("signing_group_operators", &self.signing_group_operators.len())
            .finish()
    }
}

impl fmt::Display for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "signer with index [{}] of wallet with public key [{}]",
            self.member_index,
            hex::encode(&self.wallet_public_key)
        )
    }
}
