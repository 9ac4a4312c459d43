//! Classification of wallet Bitcoin transactions as unproven deposit sweeps.

use crate::foundation::WalletId;

/// What a single transaction input turned out to be after resolving it
/// against the host chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepInputKind {
    /// A revealed deposit that has not been swept yet.
    UnsweptDeposit,
    /// A revealed deposit already marked as swept on the host chain.
    SweptDeposit,
    /// The wallet's current main UTXO (hash matches the on-chain commitment).
    WalletMainUtxo,
    /// Anything else.
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepClassification {
    /// A deposit sweep transaction whose proof has not been submitted yet.
    Unproven,
    /// A deposit sweep transaction that was already proven; its deposit
    /// inputs are marked as swept.
    AlreadyProven,
    /// Not a deposit sweep transaction.
    NotDepositSweep,
}

/// Classifies a candidate transaction. A deposit sweep has exactly one
/// output and all its inputs are revealed deposits, except for at most one
/// input which may be the wallet's current main UTXO. At least one input
/// must be a deposit; that distinguishes a sweep from other transaction
/// types spending the main UTXO, e.g. a redemption.
pub fn classify_sweep_candidate(output_count: usize, inputs: &[SweepInputKind]) -> SweepClassification {
    if output_count != 1 {
        return SweepClassification::NotDepositSweep;
    }

    let mut has_deposit_inputs = false;

    for input in inputs {
        match input {
            SweepInputKind::UnsweptDeposit => has_deposit_inputs = true,
            SweepInputKind::SweptDeposit => return SweepClassification::AlreadyProven,
            SweepInputKind::WalletMainUtxo => {}
            SweepInputKind::Other => return SweepClassification::NotDepositSweep,
        }
    }

    if has_deposit_inputs {
        SweepClassification::Unproven
    } else {
        SweepClassification::NotDepositSweep
    }
}

/// Deduplicates wallet public key hashes coming from proposal events,
/// preserving first-seen order. There will often be multiple events emitted
/// for a single wallet.
pub fn unique_wallet_ids(wallet_ids: impl IntoIterator<Item = WalletId>) -> Vec<WalletId> {
    let mut seen = std::collections::HashSet::new();
    wallet_ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
