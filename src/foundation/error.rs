use crate::foundation::types::{MemberIndex, WalletId};
use std::io;
use thiserror::Error;

/// Coarse failure classes used by the control loops to decide what to do with
/// an error that bubbled up from a lower layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried at the loop level with back-off. Never fatal.
    Transient,
    /// The current task exits; sibling tasks continue.
    ProtocolAbort,
    /// Another member acted first. Not an error; the task exits cleanly.
    LostRace,
    /// Fatal for the current action; logged with context.
    Fatal,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("unsupported operator key curve: {0}")]
    UnsupportedCurve(String),

    #[error("chain error during {operation}: {details}")]
    ChainError { operation: String, details: String },

    #[error("bitcoin error during {operation}: {details}")]
    BitcoinError { operation: String, details: String },

    #[error("network error during {operation}: {details}")]
    NetworkError { operation: String, details: String },

    #[error("storage error during {operation}: {details}")]
    StorageError { operation: String, details: String },

    #[error("{format} serialization error: {details}")]
    SerializationError { format: String, details: String },

    #[error("crypto error during {operation}: {details}")]
    CryptoError { operation: String, details: String },

    #[error("pool is empty")]
    PoolEmpty,

    #[error("could not submit result with {collected} signatures for group quorum {quorum}")]
    SignatureQuorumNotMet { collected: usize, quorum: usize },

    #[error("invalid DKG result: {0}")]
    InvalidDkgResult(String),

    #[error("DKG result publication timed out")]
    PublicationTimeout,

    #[error("[member:{member_index}] could not stay in the group: {details}")]
    CouldNotStay { member_index: MemberIndex, details: String },

    #[error("wallet {wallet} is locked by another action")]
    WalletLocked { wallet: WalletId },

    #[error("proposal is invalid: {0}")]
    ProposalInvalid(String),

    #[error("request {request_index}/{request_count} is not a pending redemption request")]
    PendingRequestMissing { request_index: usize, request_count: usize },

    #[error("wallet has no confirmed main UTXO")]
    MainUtxoNotFound,

    #[error("wallet state is not synced between chains: {0}")]
    WalletNotSynced(String),

    #[error("invalid proposal expiry block {expiry_block} for safety margin {safety_margin}")]
    InvalidProposalExpiry { expiry_block: u64, safety_margin: u64 },

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("transaction broadcast timed out: {0}")]
    BroadcastTimeout(String),

    #[error("wallet max BTC transfer must be positive")]
    MaxBtcTransferZero,

    #[error("not enough target wallets: required {required}, found {found}")]
    NotEnoughTargetWallets { required: usize, found: usize },

    #[error("target wallets hash must match commitment hash")]
    WrongCommitmentHash,

    #[error("executing operator not found among wallet operators")]
    NoExecutingOperator,

    #[error("commitment transaction not included in the chain")]
    CommitmentNotIncluded,

    #[error("estimated fee {estimated} exceeds the maximum fee {max}")]
    FeeTooHigh { estimated: u64, max: u64 },

    #[error("another relay request in progress")]
    RelayRequestInProgress,

    #[error("operator not registered for the staking provider")]
    OperatorUnknown,

    #[error("{0}")]
    Message(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Classify this error the way the control loops react to it. Lower
    /// layers surface structured errors; classification happens here, once,
    /// so no error crosses a task boundary unclassified.
    pub fn class(&self) -> ErrorClass {
        match self {
            BridgeError::ChainError { .. }
            | BridgeError::BitcoinError { .. }
            | BridgeError::NetworkError { .. }
            | BridgeError::StorageError { .. } => ErrorClass::Transient,

            BridgeError::PoolEmpty
            | BridgeError::SignatureQuorumNotMet { .. }
            | BridgeError::InvalidDkgResult(_)
            | BridgeError::SigningFailed(_)
            | BridgeError::CryptoError { .. }
            | BridgeError::SerializationError { .. } => ErrorClass::ProtocolAbort,

            BridgeError::PublicationTimeout | BridgeError::CouldNotStay { .. } => ErrorClass::LostRace,

            _ => ErrorClass::Fatal,
        }
    }

    pub fn chain(operation: impl Into<String>, details: impl ToString) -> Self {
        BridgeError::ChainError { operation: operation.into(), details: details.to_string() }
    }

    pub fn bitcoin(operation: impl Into<String>, details: impl ToString) -> Self {
        BridgeError::BitcoinError { operation: operation.into(), details: details.to_string() }
    }

    pub fn network(operation: impl Into<String>, details: impl ToString) -> Self {
        BridgeError::NetworkError { operation: operation.into(), details: details.to_string() }
    }

    pub fn storage(operation: impl Into<String>, details: impl ToString) -> Self {
        BridgeError::StorageError { operation: operation.into(), details: details.to_string() }
    }
}

impl From<hex::FromHexError> for BridgeError {
    fn from(err: hex::FromHexError) -> Self {
        BridgeError::SerializationError { format: "hex".to_string(), details: err.to_string() }
    }
}

impl From<bincode::Error> for BridgeError {
    fn from(err: bincode::Error) -> Self {
        BridgeError::SerializationError { format: "bincode".to_string(), details: err.to_string() }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::SerializationError { format: "json".to_string(), details: err.to_string() }
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::ConfigError(format!("TOML parsing error: {}", err))
    }
}

impl From<rocksdb::Error> for BridgeError {
    fn from(err: rocksdb::Error) -> Self {
        BridgeError::StorageError { operation: "rocksdb".to_string(), details: err.to_string() }
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        BridgeError::StorageError { operation: "io".to_string(), details: err.to_string() }
    }
}

impl From<secp256k1::Error> for BridgeError {
    fn from(err: secp256k1::Error) -> Self {
        BridgeError::CryptoError { operation: "secp256k1".to_string(), details: err.to_string() }
    }
}

// NOTE: Avoid adding generic "stringly" conversions here. Use structured
// `BridgeError` variants at the call site to preserve context.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_classified_for_retry() {
        assert_eq!(BridgeError::chain("get_dkg_state", "rpc timeout").class(), ErrorClass::Transient);
        assert_eq!(BridgeError::bitcoin("broadcast", "connection refused").class(), ErrorClass::Transient);
    }

    #[test]
    fn fate_errors_are_not_fatal_for_the_node() {
        let err = BridgeError::CouldNotStay { member_index: 4, details: "misbehaving".to_string() };
        assert_eq!(err.class(), ErrorClass::LostRace);
        assert!(err.to_string().contains("[member:4]"));
    }

    #[test]
    fn inconsistent_state_is_fatal() {
        assert_eq!(BridgeError::WrongCommitmentHash.class(), ErrorClass::Fatal);
        assert_eq!(BridgeError::NoExecutingOperator.class(), ErrorClass::Fatal);
        assert_eq!(BridgeError::MainUtxoNotFound.class(), ErrorClass::Fatal);
    }
}
