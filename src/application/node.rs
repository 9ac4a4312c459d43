//! Node controller: listens to chain events and spawns DKG executions and
//! wallet action executors, one task per owned member index or proposal.

use crate::application::actions::{
    DepositSweepAction, HeartbeatAction, MovedFundsSweepAction, MovingFundsAction, RedemptionAction,
    WalletActionsDispatcher, WalletSigningExecutor,
};
use crate::application::dkg::{
    register_dkg_unmarshalers, wait_for_dkg_result_event, DkgProtocol, DkgPublisher,
};
use crate::application::pool::{GenerateFn, ParameterPool, ProtocolLatch, Scheduler};
use crate::application::registry::WalletRegistry;
use crate::domain::dkg::{decide_member_fate, resolve_final_signing_group_operators, DkgResult, EcdsaPreParams};
use crate::domain::group::{member_indexes_of, GroupSelectionResult, MembershipValidator};
use crate::domain::wallet::{Signer, WalletActionType};
use crate::foundation::{hx32, BridgeError, Hash32, MemberIndex, Result, PROTOCOL_NAME};
use crate::infrastructure::bitcoin::BitcoinChain;
use crate::domain::wallet::{MovedFundsSweepProposal, MovingFundsProposal, WalletActionProposal};
use crate::foundation::WalletId;
use crate::infrastructure::chain::{
    Chain, DepositSweepProposalSubmittedEvent, HeartbeatRequestedEvent, RedemptionProposalSubmittedEvent,
};
use crate::infrastructure::config::PreParamsConfig;
use crate::infrastructure::network::{BroadcastChannel, NetworkProvider};
use crate::infrastructure::storage::{PoolPersistence, SignerStorage};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

pub struct Node {
    chain: Arc<dyn Chain>,
    btc_chain: Arc<dyn BitcoinChain>,
    network: Arc<dyn NetworkProvider>,
    wallet_registry: Arc<WalletRegistry>,
    dkg_protocol: Arc<dyn DkgProtocol>,
    signing_executor: Arc<dyn WalletSigningExecutor>,
    pre_params_pool: Arc<ParameterPool<EcdsaPreParams>>,
    protocol_latch: Arc<ProtocolLatch>,
    dispatcher: WalletActionsDispatcher,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn Chain>,
        btc_chain: Arc<dyn BitcoinChain>,
        network: Arc<dyn NetworkProvider>,
        signer_storage: Arc<dyn SignerStorage>,
        pool_persistence: Arc<dyn PoolPersistence<EcdsaPreParams>>,
        scheduler: Arc<Scheduler>,
        dkg_protocol: Arc<dyn DkgProtocol>,
        signing_executor: Arc<dyn WalletSigningExecutor>,
        pre_params_config: &PreParamsConfig,
    ) -> Result<Arc<Self>> {
        let wallet_registry = Arc::new(WalletRegistry::new(signer_storage)?);

        let protocol_latch = ProtocolLatch::new();
        scheduler.register_protocol(protocol_latch.clone());

        let generate: GenerateFn<EcdsaPreParams> = {
            let protocol = dkg_protocol.clone();
            Arc::new(move |cancel| {
                let protocol = protocol.clone();
                Box::pin(async move { protocol.generate_pre_params(cancel).await })
            })
        };
        let pre_params_pool = Arc::new(ParameterPool::new(
            scheduler,
            pool_persistence,
            pre_params_config.pool_size,
            generate,
            pre_params_config.generation_delay(),
        )?);

        Ok(Arc::new(Self {
            chain,
            btc_chain,
            network,
            wallet_registry,
            dkg_protocol,
            signing_executor,
            pre_params_pool,
            protocol_latch,
            dispatcher: WalletActionsDispatcher::new(),
        }))
    }

    pub fn wallet_registry(&self) -> Arc<WalletRegistry> {
        self.wallet_registry.clone()
    }

    pub fn pre_params_pool(&self) -> Arc<ParameterPool<EcdsaPreParams>> {
        self.pre_params_pool.clone()
    }

    /// Main control loop. Every event spawns its own task so a long-running
    /// protocol never blocks event intake.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut dkg_started = self.chain.on_dkg_started();
        let mut heartbeat_requested = self.chain.on_heartbeat_requested();
        let mut redemption_proposals = self.chain.on_redemption_proposal_submitted();
        let mut deposit_sweep_proposals = self.chain.on_deposit_sweep_proposal_submitted();

        info!("node controller started, operator [{}]", self.chain.operator_address());

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = dkg_started.recv() => {
                    let Some(event) = event else { break };
                    info!("DKG started with seed [0x{}] at block [{}]", hx32(&event.seed), event.block_number);
                    let node = self.clone();
                    tokio::spawn(async move { node.join_dkg_if_eligible(event.seed, event.block_number).await });
                }
                event = heartbeat_requested.recv() => {
                    let Some(event) = event else { break };
                    let node = self.clone();
                    tokio::spawn(async move { node.execute_heartbeat_request(event).await });
                }
                event = redemption_proposals.recv() => {
                    let Some(event) = event else { break };
                    let node = self.clone();
                    tokio::spawn(async move { node.execute_redemption_proposal(event).await });
                }
                event = deposit_sweep_proposals.recv() => {
                    let Some(event) = event else { break };
                    let node = self.clone();
                    tokio::spawn(async move { node.execute_deposit_sweep_proposal(event).await });
                }
            }
        }

        info!("node controller stopped");
    }

    /// Undergoes the distributed key generation if this node's operator is
    /// eligible for the group selected by the seed. Interactive and
    /// long-running; one task is spawned per controlled member index.
    pub async fn join_dkg_if_eligible(self: Arc<Self>, seed: Hash32, start_block: u64) {
        info!("checking eligibility for DKG with seed [0x{}]", hx32(&seed));

        let selection = match self.chain.select_group(&seed).await {
            Ok(selection) => selection,
            Err(err) => {
                error!("failed to select group with seed [0x{}]: {}", hx32(&seed), err);
                return;
            }
        };

        let group_parameters = self.chain.group_parameters();
        if selection.operators_addresses.len() != group_parameters.group_size as usize {
            error!("group size does not match the selection: [{}]", selection.operators_addresses.len());
            return;
        }

        let operator = self.chain.operator_address();
        let indexes = member_indexes_of(&operator, &selection.operators_addresses);
        if indexes.is_empty() {
            info!("not eligible for DKG with seed [0x{}]", hx32(&seed));
            return;
        }

        // One channel per DKG instance, shared by all controlled indexes.
        let channel_name = format!("{}-{}", PROTOCOL_NAME, hex::encode(seed));
        let channel = match self.network.broadcast_channel_for(&channel_name) {
            Ok(channel) => channel,
            Err(err) => {
                error!("failed to get broadcast channel: {}", err);
                return;
            }
        };
        register_dkg_unmarshalers(channel.as_ref());

        let membership = Arc::new(MembershipValidator::new(&selection.operators_addresses));
        {
            let membership = membership.clone();
            channel.set_filter(Box::new(move |public_key| membership.is_in_group(public_key)));
        }

        info!("joining DKG with seed [0x{}] and controlling [{}] group members", hx32(&seed), indexes.len());

        for member_index in indexes {
            let node = self.clone();
            let channel = channel.clone();
            let membership = membership.clone();
            let selection = selection.clone();
            tokio::spawn(async move {
                node.execute_dkg_member(seed, start_block, member_index, selection, channel, membership).await;
            });
        }
    }

    /// Runs the whole life of one controlled member index: protocol
    /// execution, result publication, failure reconciliation, and signer
    /// registration.
    async fn execute_dkg_member(
        self: Arc<Self>,
        seed: Hash32,
        start_block: u64,
        member_index: MemberIndex,
        selection: GroupSelectionResult,
        channel: Arc<dyn BroadcastChannel>,
        membership: Arc<MembershipValidator>,
    ) {
        let _latch_guard = self.protocol_latch.lock();
        let group_parameters = self.chain.group_parameters();

        let pre_params = match self.pre_params_pool.get_now() {
            Ok(pre_params) => pre_params,
            Err(err) => {
                error!("[member:{}] cannot start DKG: {}", member_index, err);
                return;
            }
        };

        let outcome = match self
            .dkg_protocol
            .execute(&seed, start_block, member_index, &group_parameters, pre_params, channel.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("[member:{}] failed to execute dkg: {}", member_index, err);
                return;
            }
        };

        let publication_start_block = outcome.execution_end_block;
        let result = outcome.result;
        let mut operating_member_indexes = result.group.operating_member_indexes();

        // Subscribe before publishing so a result submitted by a faster
        // member is never missed during reconciliation.
        let result_events = self.chain.on_dkg_result_submitted();

        let publisher = DkgPublisher::new(
            self.chain.clone(),
            group_parameters,
            selection.clone(),
            channel,
            membership,
        );

        if let Err(err) = publisher.publish_result(member_index, &result, publication_start_block, start_block).await {
            // Publication failed: either the proposed result is not
            // supported by the group majority or the chain interaction
            // failed. Observe the result published by any other member and
            // decide whether this member stays in the final group.
            warn!("[member:{}] DKG result publication process failed: {}", member_index, err);

            operating_member_indexes = match self
                .reconcile_member_fate(member_index, &result, result_events, publication_start_block)
                .await
            {
                Ok(operating) => operating,
                Err(err) => {
                    error!("failed to handle DKG result publishing failure: {}", err);
                    return;
                }
            };
        }

        let signing_group_operators = match resolve_final_signing_group_operators(
            &selection.operators_addresses,
            &operating_member_indexes,
            &group_parameters,
        ) {
            Ok(operators) => operators,
            Err(err) => {
                error!("failed to resolve group operators: {}", err);
                return;
            }
        };

        let signer = Signer {
            wallet_public_key: result.group_public_key.clone(),
            signing_group_operators,
            member_index,
            private_key_share: result.private_key_share.clone(),
        };

        match self.wallet_registry.register_signer(&signer) {
            Ok(()) => info!("registered {}", signer),
            Err(err) => error!("failed to register {}: {}", signer, err),
        }
    }

    async fn reconcile_member_fate(
        &self,
        member_index: MemberIndex,
        result: &DkgResult,
        result_events: crate::infrastructure::chain::EventSubscription<crate::infrastructure::chain::DkgResultSubmittedEvent>,
        publication_start_block: u64,
    ) -> Result<Vec<MemberIndex>> {
        let group_parameters = self.chain.group_parameters();
        let event = wait_for_dkg_result_event(
            self.chain.as_ref(),
            result_events,
            publication_start_block,
            &group_parameters,
        )
        .await?;

        decide_member_fate(member_index, result, &event.group_public_key, &event.misbehaved_members_indexes)
    }

    pub async fn execute_heartbeat_request(&self, event: HeartbeatRequestedEvent) {
        let Some(wallet) = self.wallet_registry.get_signer(&event.wallet_id) else {
            debug!("heartbeat requested for a wallet this node does not control [{}]", event.wallet_id);
            return;
        };

        let Some(_guard) = self.dispatcher.try_begin(event.wallet_id) else {
            warn!("wallet [{}] is busy with another action; skipping heartbeat", event.wallet_id);
            return;
        };

        let expiry_block = event.block_number
            + WalletActionProposal::Heartbeat(event.proposal.clone()).validity_blocks();
        let action = HeartbeatAction::new(
            self.chain.clone(),
            wallet,
            self.signing_executor.clone(),
            event.proposal,
            event.block_number,
            expiry_block,
        );

        match action.execute().await {
            Ok(_) => info!("wallet [{}] heartbeat completed", event.wallet_id),
            Err(err) => {
                error!("wallet [{}] heartbeat failed ({:?}): {}", event.wallet_id, err.class(), err)
            }
        }
    }

    pub async fn execute_redemption_proposal(&self, event: RedemptionProposalSubmittedEvent) {
        let Some(wallet) = self.wallet_registry.get_signer(&event.wallet_id) else {
            debug!("redemption proposed for a wallet this node does not control [{}]", event.wallet_id);
            return;
        };

        // The on-chain lock must be held by this very action; a lock with a
        // different cause means another action is still in progress.
        match self.chain.get_wallet_lock(&event.wallet_id).await {
            Ok(Some(lock)) if lock.cause != WalletActionType::Redemption => {
                warn!(
                    "wallet [{}] is locked by [{}] until block [{}]; skipping redemption",
                    event.wallet_id, lock.cause, lock.expires_at,
                );
                return;
            }
            Ok(_) => {}
            Err(err) => {
                error!("cannot check wallet [{}] lock: {}", event.wallet_id, err);
                return;
            }
        }

        let Some(_guard) = self.dispatcher.try_begin(event.wallet_id) else {
            warn!("wallet [{}] is busy with another action; skipping redemption", event.wallet_id);
            return;
        };

        let expiry_block = event.block_number
            + WalletActionProposal::Redemption(event.proposal.clone()).validity_blocks();

        let action = match RedemptionAction::new(
            self.chain.clone(),
            self.btc_chain.clone(),
            wallet,
            self.signing_executor.clone(),
            event.proposal,
            event.block_number,
            expiry_block,
        ) {
            Ok(action) => action,
            Err(err) => {
                error!("wallet [{}] redemption action setup failed: {}", event.wallet_id, err);
                return;
            }
        };

        match action.execute().await {
            Ok(transaction) => info!(
                "wallet [{}] redemption transaction [{}] broadcast",
                event.wallet_id,
                transaction.compute_txid(),
            ),
            Err(err) => match err {
                BridgeError::WalletLocked { .. } => {
                    warn!("wallet [{}] redemption skipped: {}", event.wallet_id, err)
                }
                err => error!("wallet [{}] redemption failed ({:?}): {}", event.wallet_id, err.class(), err),
            },
        }
    }

    pub async fn execute_deposit_sweep_proposal(&self, event: DepositSweepProposalSubmittedEvent) {
        let Some(wallet) = self.wallet_registry.get_signer(&event.wallet_id) else {
            debug!("deposit sweep proposed for a wallet this node does not control [{}]", event.wallet_id);
            return;
        };

        let Some(_guard) = self.dispatcher.try_begin(event.wallet_id) else {
            warn!("wallet [{}] is busy with another action; skipping deposit sweep", event.wallet_id);
            return;
        };

        let expiry_block = event.block_number
            + WalletActionProposal::DepositSweep(event.proposal.clone()).validity_blocks();

        let action = match DepositSweepAction::new(
            self.chain.clone(),
            self.btc_chain.clone(),
            wallet,
            self.signing_executor.clone(),
            event.proposal,
            event.block_number,
            expiry_block,
        ) {
            Ok(action) => action,
            Err(err) => {
                error!("wallet [{}] deposit sweep action setup failed: {}", event.wallet_id, err);
                return;
            }
        };

        match action.execute().await {
            Ok(transaction) => info!(
                "wallet [{}] deposit sweep transaction [{}] broadcast",
                event.wallet_id,
                transaction.compute_txid(),
            ),
            Err(err) => error!("wallet [{}] deposit sweep failed ({:?}): {}", event.wallet_id, err.class(), err),
        }
    }

    /// Entry point for the coordination leader's moving funds proposal.
    pub async fn execute_moving_funds_proposal(
        &self,
        wallet_id: WalletId,
        proposal: MovingFundsProposal,
        proposal_block_number: u64,
    ) {
        let Some(wallet) = self.wallet_registry.get_signer(&wallet_id) else {
            debug!("moving funds proposed for a wallet this node does not control [{}]", wallet_id);
            return;
        };

        let Some(_guard) = self.dispatcher.try_begin(wallet_id) else {
            warn!("wallet [{}] is busy with another action; skipping moving funds", wallet_id);
            return;
        };

        let expiry_block =
            proposal_block_number + WalletActionProposal::MovingFunds(proposal.clone()).validity_blocks();

        let action = MovingFundsAction::new(
            self.chain.clone(),
            self.btc_chain.clone(),
            wallet,
            self.signing_executor.clone(),
            proposal,
            proposal_block_number,
            expiry_block,
        );

        match action.execute().await {
            Ok(transaction) => {
                info!("wallet [{}] moving funds transaction [{}] broadcast", wallet_id, transaction.compute_txid())
            }
            Err(err) => error!("wallet [{}] moving funds failed ({:?}): {}", wallet_id, err.class(), err),
        }
    }

    /// Entry point for the coordination leader's moved funds sweep proposal.
    pub async fn execute_moved_funds_sweep_proposal(
        &self,
        wallet_id: WalletId,
        proposal: MovedFundsSweepProposal,
        proposal_block_number: u64,
    ) {
        let Some(wallet) = self.wallet_registry.get_signer(&wallet_id) else {
            debug!("moved funds sweep proposed for a wallet this node does not control [{}]", wallet_id);
            return;
        };

        let Some(_guard) = self.dispatcher.try_begin(wallet_id) else {
            warn!("wallet [{}] is busy with another action; skipping moved funds sweep", wallet_id);
            return;
        };

        let expiry_block =
            proposal_block_number + WalletActionProposal::MovedFundsSweep(proposal.clone()).validity_blocks();

        let action = match MovedFundsSweepAction::new(
            self.chain.clone(),
            self.btc_chain.clone(),
            wallet,
            self.signing_executor.clone(),
            proposal,
            proposal_block_number,
            expiry_block,
        ) {
            Ok(action) => action,
            Err(err) => {
                error!("wallet [{}] moved funds sweep action setup failed: {}", wallet_id, err);
                return;
            }
        };

        match action.execute().await {
            Ok(transaction) => {
                info!("wallet [{}] moved funds sweep transaction [{}] broadcast", wallet_id, transaction.compute_txid())
            }
            Err(err) => error!("wallet [{}] moved funds sweep failed ({:?}): {}", wallet_id, err.class(), err),
        }
    }
}
