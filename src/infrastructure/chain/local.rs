//! In-process implementation of the chain facade. Backs integration tests
//! and local development networks: block height is advanced manually and
//! every mutator records what a real chain would persist.

use crate::domain::dkg::{canonical_result_signature_hash, validate_dkg_chain_result, DkgChainResult};
use crate::domain::group::{operator_address_from_public_key, GroupParameters, GroupSelectionResult};
use crate::domain::redemption::RedemptionRequest;
use crate::domain::relay::RelayRequest;
use crate::domain::wallet::{
    DepositChainData, DepositSweepProposal, HeartbeatProposal, RedemptionProposal, UnspentTransactionOutput,
    WalletActionType, WalletChainData, WalletLock, WalletState,
};
use crate::foundation::{BridgeError, ChainAddress, Hash32, MemberIndex, OperatorId, Result, WalletId};
use crate::infrastructure::bitcoin::SpvProof;
use crate::infrastructure::chain::{
    main_utxo_hash, moving_funds_commitment_hash, verify_signature, BlockCounter, Chain, DepositSweepProposalSubmittedEvent,
    DkgParameters, DkgResultApprovedEvent, DkgResultChallengedEvent, DkgResultSubmittedEvent, DkgStartedEvent,
    DkgStartedEventFilter, DkgState, EventSubscription, HeartbeatRequestedEvent, MovingFundsCommitmentSubmittedEvent,
    OperatorSigner, ProposalEventFilter, RedemptionProposalSubmittedEvent, Signing, Subscribers, WalletParameters,
};
use async_trait::async_trait;
use bitcoin::{ScriptBuf, Transaction, Txid};
use secp256k1::PublicKey;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

struct LocalChainState {
    dkg_state: DkgState,
    dkg_parameters: DkgParameters,
    dkg_start_block: u64,
    group_selection: Option<GroupSelectionResult>,
    operators: HashMap<ChainAddress, PublicKey>,
    operator_ids: HashMap<ChainAddress, OperatorId>,
    next_operator_id: OperatorId,
    submitted_dkg_results: Vec<DkgChainResult>,
    dkg_started_events: Vec<DkgStartedEvent>,

    wallets: HashMap<WalletId, WalletChainData>,
    wallet_locks: HashMap<WalletId, WalletLock>,
    pending_redemption_requests: HashMap<(WalletId, Vec<u8>), RedemptionRequest>,
    deposits: HashMap<(Txid, u32), DepositChainData>,
    deposit_sweep_proposal_events: Vec<DepositSweepProposalSubmittedEvent>,
    moving_funds_commitment_events: Vec<MovingFundsCommitmentSubmittedEvent>,
    submitted_sweep_proofs: Vec<(Txid, Option<UnspentTransactionOutput>)>,
    wallet_parameters: WalletParameters,
    live_wallets_count: u32,
    tx_proof_difficulty_factor: u64,

    relay_request: RelayRequest,
    next_relay_request_id: u64,

    staking_provider: Option<ChainAddress>,
    operator_in_pool: bool,
    operator_up_to_date: bool,
    pool_locked: bool,
    eligible_for_rewards: bool,
    can_restore_rewards: bool,
    join_pool_calls: u32,
    update_status_calls: u32,
    restore_rewards_calls: u32,
}

impl LocalChainState {
    fn new() -> Self {
        Self {
            dkg_state: DkgState::Idle,
            dkg_parameters: DkgParameters::default(),
            dkg_start_block: 0,
            group_selection: None,
            operators: HashMap::new(),
            operator_ids: HashMap::new(),
            next_operator_id: 1,
            submitted_dkg_results: Vec::new(),
            dkg_started_events: Vec::new(),
            wallets: HashMap::new(),
            wallet_locks: HashMap::new(),
            pending_redemption_requests: HashMap::new(),
            deposits: HashMap::new(),
            deposit_sweep_proposal_events: Vec::new(),
            moving_funds_commitment_events: Vec::new(),
            submitted_sweep_proofs: Vec::new(),
            wallet_parameters: WalletParameters::default(),
            live_wallets_count: 0,
            tx_proof_difficulty_factor: 6,
            relay_request: RelayRequest::default(),
            next_relay_request_id: 1,
            staking_provider: None,
            operator_in_pool: false,
            operator_up_to_date: false,
            pool_locked: false,
            eligible_for_rewards: true,
            can_restore_rewards: false,
            join_pool_calls: 0,
            update_status_calls: 0,
            restore_rewards_calls: 0,
        }
    }
}

struct EventHubs {
    dkg_started: Subscribers<DkgStartedEvent>,
    dkg_result_submitted: Subscribers<DkgResultSubmittedEvent>,
    dkg_result_challenged: Subscribers<DkgResultChallengedEvent>,
    dkg_result_approved: Subscribers<DkgResultApprovedEvent>,
    heartbeat_requested: Subscribers<HeartbeatRequestedEvent>,
    redemption_proposal_submitted: Subscribers<RedemptionProposalSubmittedEvent>,
    deposit_sweep_proposal_submitted: Subscribers<DepositSweepProposalSubmittedEvent>,
}

pub struct LocalChain {
    signer: Arc<OperatorSigner>,
    group_parameters: GroupParameters,
    block_sender: watch::Sender<u64>,
    block_receiver: watch::Receiver<u64>,
    state: Mutex<LocalChainState>,
    hubs: EventHubs,
}

struct LocalBlockCounter {
    receiver: watch::Receiver<u64>,
}

#[async_trait]
impl BlockCounter for LocalBlockCounter {
    async fn current_block(&self) -> Result<u64> {
        Ok(*self.receiver.borrow())
    }

    async fn wait_for_block(&self, block: u64) -> Result<u64> {
        let mut receiver = self.receiver.clone();
        loop {
            let current = *receiver.borrow();
            if current >= block {
                return Ok(current);
            }
            receiver
                .changed()
                .await
                .map_err(|_| BridgeError::chain("wait_for_block", "block counter closed"))?;
        }
    }
}

impl LocalChain {
    pub fn new(signer: Arc<OperatorSigner>, group_parameters: GroupParameters) -> Self {
        let (block_sender, block_receiver) = watch::channel(0);
        let chain = Self {
            signer,
            group_parameters,
            block_sender,
            block_receiver,
            state: Mutex::new(LocalChainState::new()),
            hubs: EventHubs {
                dkg_started: Subscribers::new(),
                dkg_result_submitted: Subscribers::new(),
                dkg_result_challenged: Subscribers::new(),
                dkg_result_approved: Subscribers::new(),
                heartbeat_requested: Subscribers::new(),
                redemption_proposal_submitted: Subscribers::new(),
                deposit_sweep_proposal_submitted: Subscribers::new(),
            },
        };
        // The local operator is always a registered chain participant.
        let public_key = chain.signer.public_key();
        chain.register_operator(&public_key);
        chain
    }

    fn lock_state(&self) -> MutexGuard<'_, LocalChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_block(&self) -> u64 {
        *self.block_receiver.borrow()
    }

    pub fn operator_address(&self) -> ChainAddress {
        self.signer.address()
    }

    // === Test drivers ===

    pub fn set_current_block(&self, block: u64) {
        let _ = self.block_sender.send(block);
    }

    pub fn register_operator(&self, public_key: &PublicKey) -> ChainAddress {
        let address = operator_address_from_public_key(public_key);
        let mut state = self.lock_state();
        state.operators.insert(address.clone(), *public_key);
        if !state.operator_ids.contains_key(&address) {
            let id = state.next_operator_id;
            state.next_operator_id += 1;
            state.operator_ids.insert(address.clone(), id);
        }
        address
    }

    pub fn set_group_selection_result(&self, result: GroupSelectionResult) {
        self.lock_state().group_selection = Some(result);
    }

    pub fn set_dkg_state(&self, dkg_state: DkgState) {
        self.lock_state().dkg_state = dkg_state;
    }

    /// Moves the DKG state machine to `AwaitingResult` and emits the start
    /// event at the current block.
    pub fn start_dkg(&self, seed: Hash32) {
        let block_number = self.current_block();
        let event = DkgStartedEvent { seed, block_number };
        {
            let mut state = self.lock_state();
            state.dkg_state = DkgState::AwaitingResult;
            state.dkg_start_block = block_number;
            state.dkg_started_events.push(event.clone());
        }
        self.hubs.dkg_started.publish(&event);
    }

    pub fn set_wallet(&self, wallet_id: WalletId, data: WalletChainData) {
        self.lock_state().wallets.insert(wallet_id, data);
    }

    pub fn set_pending_redemption_request(&self, wallet_id: WalletId, request: RedemptionRequest) {
        let key = (wallet_id, request.redeemer_output_script.as_bytes().to_vec());
        self.lock_state().pending_redemption_requests.insert(key, request);
    }

    pub fn set_deposit(&self, funding_tx_hash: Txid, funding_output_index: u32, deposit: DepositChainData) {
        self.lock_state().deposits.insert((funding_tx_hash, funding_output_index), deposit);
    }

    pub fn set_tx_proof_difficulty_factor(&self, factor: u64) {
        self.lock_state().tx_proof_difficulty_factor = factor;
    }

    pub fn set_live_wallets_count(&self, count: u32) {
        self.lock_state().live_wallets_count = count;
    }

    pub fn set_wallet_parameters(&self, parameters: WalletParameters) {
        self.lock_state().wallet_parameters = parameters;
    }

    pub fn set_staking_provider(&self, provider: Option<ChainAddress>) {
        self.lock_state().staking_provider = provider;
    }

    pub fn set_sortition_status(&self, in_pool: bool, up_to_date: bool, locked: bool) {
        let mut state = self.lock_state();
        state.operator_in_pool = in_pool;
        state.operator_up_to_date = up_to_date;
        state.pool_locked = locked;
    }

    pub fn set_rewards_eligibility(&self, eligible: bool, can_restore: bool) {
        let mut state = self.lock_state();
        state.eligible_for_rewards = eligible;
        state.can_restore_rewards = can_restore;
    }

    pub fn request_heartbeat(&self, wallet_id: WalletId, proposal: HeartbeatProposal) {
        let event = HeartbeatRequestedEvent { wallet_id, proposal, block_number: self.current_block() };
        self.hubs.heartbeat_requested.publish(&event);
    }

    /// Submits a redemption proposal on behalf of the coordination leader:
    /// locks the wallet for the validity window and notifies subscribers.
    pub fn submit_redemption_proposal(&self, wallet_id: WalletId, proposal: RedemptionProposal) {
        let block_number = self.current_block();
        {
            let mut state = self.lock_state();
            state.wallet_locks.insert(
                wallet_id,
                WalletLock {
                    expires_at: block_number + crate::foundation::REDEMPTION_PROPOSAL_VALIDITY_BLOCKS,
                    cause: WalletActionType::Redemption,
                },
            );
        }
        let event = RedemptionProposalSubmittedEvent { wallet_id, proposal, block_number };
        self.hubs.redemption_proposal_submitted.publish(&event);
    }

    pub fn release_wallet_lock(&self, wallet_id: &WalletId) {
        self.lock_state().wallet_locks.remove(wallet_id);
    }

    pub fn submit_deposit_sweep_proposal(
        &self,
        wallet_id: WalletId,
        proposal: DepositSweepProposal,
        proposal_submitter: ChainAddress,
    ) {
        let event = DepositSweepProposalSubmittedEvent {
            wallet_id,
            proposal,
            proposal_submitter,
            block_number: self.current_block(),
        };
        self.lock_state().deposit_sweep_proposal_events.push(event.clone());
        self.hubs.deposit_sweep_proposal_submitted.publish(&event);
    }

    /// Emits a result-submitted event on behalf of a remote member, moving
    /// the DKG state machine to `Challenge`.
    pub fn notify_dkg_result_submitted(&self, group_public_key: Vec<u8>, misbehaved_members_indexes: Vec<MemberIndex>) {
        let event = {
            let mut state = self.lock_state();
            state.dkg_state = DkgState::Challenge;
            let mut hasher = blake3::Hasher::new();
            hasher.update(b"tideway:dkg_chain_result:v1:");
            hasher.update(&group_public_key);
            DkgResultSubmittedEvent {
                result_hash: *hasher.finalize().as_bytes(),
                group_public_key,
                misbehaved_members_indexes,
                block_number: *self.block_receiver.borrow(),
            }
        };
        self.hubs.dkg_result_submitted.publish(&event);
    }

    // === Test accessors ===

    pub fn submitted_dkg_results(&self) -> Vec<DkgChainResult> {
        self.lock_state().submitted_dkg_results.clone()
    }

    pub fn wallet_data(&self, wallet_id: &WalletId) -> Option<WalletChainData> {
        self.lock_state().wallets.get(wallet_id).cloned()
    }

    pub fn submitted_sweep_proofs(&self) -> Vec<(Txid, Option<UnspentTransactionOutput>)> {
        self.lock_state().submitted_sweep_proofs.clone()
    }

    pub fn moving_funds_commitment_count(&self) -> usize {
        self.lock_state().moving_funds_commitment_events.len()
    }

    pub fn sortition_call_counts(&self) -> (u32, u32, u32) {
        let state = self.lock_state();
        (state.join_pool_calls, state.update_status_calls, state.restore_rewards_calls)
    }

    fn member_public_key(&self, member_index: MemberIndex) -> Option<PublicKey> {
        let state = self.lock_state();
        let selection = state.group_selection.as_ref()?;
        let address = selection.operators_addresses.get(member_index as usize - 1)?;
        state.operators.get(address).copied()
    }

    fn result_hash(result: &DkgChainResult) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tideway:dkg_chain_result:v1:");
        hasher.update(&result.group_public_key);
        hasher.update(&result.members_hash);
        *hasher.finalize().as_bytes()
    }
}

#[async_trait]
impl Chain for LocalChain {
    fn block_counter(&self) -> Arc<dyn BlockCounter> {
        Arc::new(LocalBlockCounter { receiver: self.block_receiver.clone() })
    }

    fn signing(&self) -> Arc<dyn Signing> {
        self.signer.clone()
    }

    fn operator_address(&self) -> ChainAddress {
        self.signer.address()
    }

    fn group_parameters(&self) -> GroupParameters {
        self.group_parameters
    }

    async fn select_group(&self, _seed: &Hash32) -> Result<GroupSelectionResult> {
        self.lock_state()
            .group_selection
            .clone()
            .ok_or_else(|| BridgeError::chain("select_group", "group selection not available"))
    }

    async fn get_operator_id(&self, operator: &ChainAddress) -> Result<OperatorId> {
        self.lock_state()
            .operator_ids
            .get(operator)
            .copied()
            .ok_or_else(|| BridgeError::chain("get_operator_id", format!("unknown operator {}", operator)))
    }

    fn on_dkg_started(&self) -> EventSubscription<DkgStartedEvent> {
        self.hubs.dkg_started.subscribe()
    }

    async fn past_dkg_started_events(&self, filter: &DkgStartedEventFilter) -> Result<Vec<DkgStartedEvent>> {
        let state = self.lock_state();
        Ok(state
            .dkg_started_events
            .iter()
            .filter(|event| {
                event.block_number >= filter.start_block
                    && filter.end_block.map_or(true, |end| event.block_number <= end)
            })
            .cloned()
            .collect())
    }

    fn on_dkg_result_submitted(&self) -> EventSubscription<DkgResultSubmittedEvent> {
        self.hubs.dkg_result_submitted.subscribe()
    }

    fn on_dkg_result_challenged(&self) -> EventSubscription<DkgResultChallengedEvent> {
        self.hubs.dkg_result_challenged.subscribe()
    }

    fn on_dkg_result_approved(&self) -> EventSubscription<DkgResultApprovedEvent> {
        self.hubs.dkg_result_approved.subscribe()
    }

    async fn get_dkg_state(&self) -> Result<DkgState> {
        Ok(self.lock_state().dkg_state)
    }

    async fn dkg_parameters(&self) -> Result<DkgParameters> {
        Ok(self.lock_state().dkg_parameters)
    }

    fn calculate_dkg_result_signature_hash(
        &self,
        group_public_key: &[u8],
        misbehaved_members_indexes: &[MemberIndex],
        start_block: u64,
    ) -> Result<Hash32> {
        Ok(canonical_result_signature_hash(group_public_key, misbehaved_members_indexes, start_block))
    }

    async fn assemble_dkg_result(
        &self,
        submitter_member_index: MemberIndex,
        group_public_key: &[u8],
        operating_members_indexes: &[MemberIndex],
        misbehaved_members_indexes: &[MemberIndex],
        signatures: &BTreeMap<MemberIndex, Vec<u8>>,
        group_selection_result: &GroupSelectionResult,
    ) -> Result<DkgChainResult> {
        let _ = operating_members_indexes;

        let mut members_hasher = blake3::Hasher::new();
        for id in &group_selection_result.operators_ids {
            members_hasher.update(&id.to_le_bytes());
        }

        Ok(DkgChainResult {
            submitter_member_index,
            group_public_key: group_public_key.to_vec(),
            misbehaved_members_indexes: misbehaved_members_indexes.to_vec(),
            signatures: signatures.clone(),
            signing_members_indexes: signatures.keys().copied().collect(),
            members: group_selection_result.operators_ids.clone(),
            members_hash: *members_hasher.finalize().as_bytes(),
        })
    }

    async fn is_dkg_result_valid(&self, result: &DkgChainResult) -> Result<bool> {
        let (start_block, params) = {
            let state = self.lock_state();
            (state.dkg_start_block, self.group_parameters)
        };
        let expected_hash =
            canonical_result_signature_hash(&result.group_public_key, &result.misbehaved_members_indexes, start_block);

        let validation = validate_dkg_chain_result(
            result,
            &params,
            &expected_hash,
            |member_index| self.member_public_key(member_index),
            |hash, signature, public_key| verify_signature(hash, signature, public_key).unwrap_or(false),
        );

        match validation {
            Ok(()) => Ok(true),
            Err(reason) => {
                log::debug!("DKG result rejected: {}", reason);
                Ok(false)
            }
        }
    }

    async fn submit_dkg_result(&self, result: &DkgChainResult) -> Result<()> {
        if !self.is_dkg_result_valid(result).await? {
            return Err(BridgeError::chain("submit_dkg_result", "result rejected by the chain"));
        }

        let event = {
            let mut state = self.lock_state();
            if state.dkg_state != DkgState::AwaitingResult {
                return Err(BridgeError::chain("submit_dkg_result", "DKG is not awaiting the result"));
            }
            state.dkg_state = DkgState::Challenge;
            state.submitted_dkg_results.push(result.clone());
            DkgResultSubmittedEvent {
                result_hash: Self::result_hash(result),
                group_public_key: result.group_public_key.clone(),
                misbehaved_members_indexes: result.misbehaved_members_indexes.clone(),
                block_number: self.current_block(),
            }
        };
        self.hubs.dkg_result_submitted.publish(&event);
        Ok(())
    }

    async fn challenge_dkg_result(&self, result: &DkgChainResult) -> Result<()> {
        let event = {
            let mut state = self.lock_state();
            if state.dkg_state != DkgState::Challenge {
                return Err(BridgeError::chain("challenge_dkg_result", "no result under challenge"));
            }
            state.dkg_state = DkgState::AwaitingResult;
            DkgResultChallengedEvent {
                result_hash: Self::result_hash(result),
                challenger: self.signer.address(),
                reason: "challenged by local operator".to_string(),
                block_number: self.current_block(),
            }
        };
        self.hubs.dkg_result_challenged.publish(&event);
        Ok(())
    }

    async fn approve_dkg_result(&self, result: &DkgChainResult) -> Result<()> {
        let event = {
            let mut state = self.lock_state();
            if state.dkg_state != DkgState::Challenge {
                return Err(BridgeError::chain("approve_dkg_result", "no result to approve"));
            }
            state.dkg_state = DkgState::Idle;
            DkgResultApprovedEvent {
                result_hash: Self::result_hash(result),
                approver: self.signer.address(),
                block_number: self.current_block(),
            }
        };
        self.hubs.dkg_result_approved.publish(&event);
        Ok(())
    }

    fn on_heartbeat_requested(&self) -> EventSubscription<HeartbeatRequestedEvent> {
        self.hubs.heartbeat_requested.subscribe()
    }

    fn on_redemption_proposal_submitted(&self) -> EventSubscription<RedemptionProposalSubmittedEvent> {
        self.hubs.redemption_proposal_submitted.subscribe()
    }

    fn on_deposit_sweep_proposal_submitted(&self) -> EventSubscription<DepositSweepProposalSubmittedEvent> {
        self.hubs.deposit_sweep_proposal_submitted.subscribe()
    }

    async fn past_deposit_sweep_proposal_submitted_events(
        &self,
        filter: &ProposalEventFilter,
    ) -> Result<Vec<DepositSweepProposalSubmittedEvent>> {
        let state = self.lock_state();
        Ok(state
            .deposit_sweep_proposal_events
            .iter()
            .filter(|event| filter.matches(event.block_number, &event.wallet_id))
            .cloned()
            .collect())
    }

    async fn past_moving_funds_commitment_submitted_events(
        &self,
        filter: &ProposalEventFilter,
    ) -> Result<Vec<MovingFundsCommitmentSubmittedEvent>> {
        let state = self.lock_state();
        Ok(state
            .moving_funds_commitment_events
            .iter()
            .filter(|event| filter.matches(event.block_number, &event.wallet_id))
            .cloned()
            .collect())
    }

    async fn get_wallet(&self, wallet_id: &WalletId) -> Result<WalletChainData> {
        self.lock_state()
            .wallets
            .get(wallet_id)
            .cloned()
            .ok_or_else(|| BridgeError::chain("get_wallet", format!("unknown wallet {}", wallet_id)))
    }

    async fn get_wallet_lock(&self, wallet_id: &WalletId) -> Result<Option<WalletLock>> {
        let current_block = self.current_block();
        Ok(self
            .lock_state()
            .wallet_locks
            .get(wallet_id)
            .filter(|lock| lock.expires_at > current_block)
            .cloned())
    }

    async fn validate_redemption_proposal(&self, wallet_id: &WalletId, proposal: &RedemptionProposal) -> Result<()> {
        if proposal.redeemers_output_scripts.is_empty() {
            return Err(BridgeError::ProposalInvalid("no redeemer output scripts".to_string()));
        }

        let state = self.lock_state();

        let wallet = state
            .wallets
            .get(wallet_id)
            .ok_or_else(|| BridgeError::ProposalInvalid(format!("unknown wallet {}", wallet_id)))?;
        if wallet.state != WalletState::Live {
            return Err(BridgeError::ProposalInvalid("wallet is not in Live state".to_string()));
        }

        let mut max_fee_total = 0u64;
        for script in &proposal.redeemers_output_scripts {
            let request = state
                .pending_redemption_requests
                .get(&(*wallet_id, script.as_bytes().to_vec()))
                .ok_or_else(|| BridgeError::ProposalInvalid("redemption request is not pending".to_string()))?;
            max_fee_total += request.tx_max_fee;
        }

        if proposal.redemption_tx_fee > max_fee_total {
            return Err(BridgeError::ProposalInvalid(format!(
                "proposed fee {} exceeds the requests' maximum {}",
                proposal.redemption_tx_fee, max_fee_total,
            )));
        }

        Ok(())
    }

    async fn get_pending_redemption_request(
        &self,
        wallet_id: &WalletId,
        redeemer_output_script: &ScriptBuf,
    ) -> Result<Option<RedemptionRequest>> {
        Ok(self
            .lock_state()
            .pending_redemption_requests
            .get(&(*wallet_id, redeemer_output_script.as_bytes().to_vec()))
            .cloned())
    }

    fn compute_main_utxo_hash(&self, utxo: &UnspentTransactionOutput) -> Hash32 {
        main_utxo_hash(utxo)
    }

    fn compute_moving_funds_commitment_hash(&self, target_wallets: &[WalletId]) -> Hash32 {
        moving_funds_commitment_hash(target_wallets)
    }

    async fn deposits(&self, funding_tx_hash: &Txid, funding_output_index: u32) -> Result<DepositChainData> {
        Ok(self
            .lock_state()
            .deposits
            .get(&(*funding_tx_hash, funding_output_index))
            .copied()
            .unwrap_or_default())
    }

    async fn submit_deposit_sweep_proof_with_reimbursement(
        &self,
        transaction: &Transaction,
        _proof: &SpvProof,
        main_utxo: Option<&UnspentTransactionOutput>,
        _vault: Option<ChainAddress>,
    ) -> Result<()> {
        let mut state = self.lock_state();
        state.submitted_sweep_proofs.push((transaction.compute_txid(), main_utxo.copied()));

        // The proof marks every deposit input as swept.
        for input in &transaction.input {
            let key = (input.previous_output.txid, input.previous_output.vout);
            if let Some(deposit) = state.deposits.get_mut(&key) {
                if deposit.is_revealed() {
                    deposit.swept_at = 1;
                }
            }
        }
        Ok(())
    }

    async fn tx_proof_difficulty_factor(&self) -> Result<u64> {
        Ok(self.lock_state().tx_proof_difficulty_factor)
    }

    async fn submit_moving_funds_commitment(
        &self,
        wallet_id: &WalletId,
        _wallet_main_utxo: &UnspentTransactionOutput,
        _wallet_members_ids: &[OperatorId],
        _wallet_member_index: MemberIndex,
        target_wallets: &[WalletId],
    ) -> Result<()> {
        let mut state = self.lock_state();
        let commitment_hash = moving_funds_commitment_hash(target_wallets);
        let wallet = state
            .wallets
            .get_mut(wallet_id)
            .ok_or_else(|| BridgeError::chain("submit_moving_funds_commitment", "unknown wallet"))?;
        if wallet.moving_funds_target_wallets_commitment_hash != [0u8; 32] {
            return Err(BridgeError::chain("submit_moving_funds_commitment", "commitment already submitted"));
        }
        wallet.moving_funds_target_wallets_commitment_hash = commitment_hash;
        let event = MovingFundsCommitmentSubmittedEvent {
            wallet_id: *wallet_id,
            target_wallets: target_wallets.to_vec(),
            block_number: *self.block_receiver.borrow(),
        };
        state.moving_funds_commitment_events.push(event);
        Ok(())
    }

    async fn get_wallet_parameters(&self) -> Result<WalletParameters> {
        Ok(self.lock_state().wallet_parameters)
    }

    async fn get_live_wallets_count(&self) -> Result<u32> {
        Ok(self.lock_state().live_wallets_count)
    }

    async fn current_relay_request(&self) -> Result<RelayRequest> {
        Ok(self.lock_state().relay_request.clone())
    }

    async fn request_relay_entry(&self, group_id: u64, previous_entry: &[u8]) -> Result<RelayRequest> {
        let current_block = self.current_block();
        let mut state = self.lock_state();
        if state.relay_request.in_progress() {
            return Err(BridgeError::RelayRequestInProgress);
        }
        let request = RelayRequest {
            id: state.next_relay_request_id,
            group_id,
            start_block: current_block,
            previous_entry: previous_entry.to_vec(),
        };
        state.next_relay_request_id += 1;
        state.relay_request = request.clone();
        Ok(request)
    }

    async fn operator_to_staking_provider(&self) -> Result<Option<ChainAddress>> {
        Ok(self.lock_state().staking_provider.clone())
    }

    async fn is_operator_in_pool(&self) -> Result<bool> {
        Ok(self.lock_state().operator_in_pool)
    }

    async fn is_operator_up_to_date(&self) -> Result<bool> {
        Ok(self.lock_state().operator_up_to_date)
    }

    async fn is_pool_locked(&self) -> Result<bool> {
        Ok(self.lock_state().pool_locked)
    }

    async fn join_sortition_pool(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.join_pool_calls += 1;
        state.operator_in_pool = true;
        state.operator_up_to_date = true;
        Ok(())
    }

    async fn update_operator_status(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.update_status_calls += 1;
        state.operator_up_to_date = true;
        Ok(())
    }

    async fn is_eligible_for_rewards(&self) -> Result<bool> {
        Ok(self.lock_state().eligible_for_rewards)
    }

    async fn can_restore_reward_eligibility(&self) -> Result<bool> {
        Ok(self.lock_state().can_restore_rewards)
    }

    async fn restore_reward_eligibility(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.restore_rewards_calls += 1;
        state.eligible_for_rewards = true;
        Ok(())
    }
}
