use std::time::Duration;

/// Protocol name used as the prefix of DKG broadcast channel names.
pub const PROTOCOL_NAME: &str = "tideway";

/// Number of blocks the publication phase spends on signature collection
/// before the first member becomes eligible to submit the result on-chain.
pub const PRE_PUBLICATION_BLOCKS: u64 = 5;

/// Worst-case redemption duration expressed in blocks. While the proposal is
/// valid the wallet is busy and cannot take another action. Roughly 2 hours
/// assuming 12 seconds per block.
pub const REDEMPTION_PROPOSAL_VALIDITY_BLOCKS: u64 = 600;

/// Safety margin preserved between the signing timeout and the timeout of the
/// entire redemption action. Signing that completes after the validity window
/// may leak wallet signatures, so signing must stop this many blocks before
/// the proposal expires. Roughly 1 hour assuming 12 seconds per block.
pub const REDEMPTION_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS: u64 = 300;

/// Time window for redemption transaction broadcast. The happy path is quick;
/// if broadcast does not succeed within this window there is no point
/// retrying for the rest of the action timeout.
pub const REDEMPTION_BROADCAST_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Delay between transaction broadcast and the check that the transaction is
/// known on the Bitcoin chain. Spreading a transaction over the Bitcoin
/// network takes time.
pub const REDEMPTION_BROADCAST_CHECK_DELAY: Duration = Duration::from_secs(60);

pub const HEARTBEAT_PROPOSAL_VALIDITY_BLOCKS: u64 = 300;

pub const DEPOSIT_SWEEP_PROPOSAL_VALIDITY_BLOCKS: u64 = 1200;
pub const DEPOSIT_SWEEP_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS: u64 = 300;

pub const MOVING_FUNDS_PROPOSAL_VALIDITY_BLOCKS: u64 = 650;
pub const MOVING_FUNDS_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS: u64 = 300;

/// Number of blocks the moving funds commitment submission is allowed to wait
/// for inclusion in the host chain.
pub const MOVING_FUNDS_COMMITMENT_INCLUSION_BLOCKS: u64 = 6;

/// Look-back period in blocks used when searching for submitted moving funds
/// commitment events. Equal to 30 days assuming 12 seconds per block.
pub const MOVING_FUNDS_COMMITMENT_LOOK_BACK_BLOCKS: u64 = 216_000;

pub const MOVED_FUNDS_SWEEP_PROPOSAL_VALIDITY_BLOCKS: u64 = 560;

/// Rolling window of host-chain blocks inspected by the SPV maintainer when
/// looking for deposit sweep proposals. Roughly one week at 15 seconds per
/// block.
pub const SPV_PROPOSAL_LOOK_BACK_BLOCKS: u64 = 40_320;

/// Number of recent Bitcoin transactions fetched per wallet when searching
/// for unproven sweeps.
pub const SPV_WALLET_TRANSACTION_LIMIT: usize = 5;

/// Default tick of the sortition pool status monitor.
pub const DEFAULT_STATUS_CHECK_TICK: Duration = Duration::from_secs(10);
