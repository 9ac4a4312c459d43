//! Sortition pool monitor: keeps the operator's pool membership and weight
//! current. Runs as an independent periodic loop.

use crate::foundation::{BridgeError, Result};
use crate::infrastructure::chain::Chain;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Periodically checks the operator's status in the sortition pool. When the
/// operator is supposed to be in the pool but is not there yet, attempts to
/// join; when the pool view of the operator is stale, attempts an update.
/// An unregistered operator is a fatal error returned to the caller.
pub async fn monitor_pool(chain: Arc<dyn Chain>, tick: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let staking_provider = chain.operator_to_staking_provider().await?;
    if staking_provider.is_none() {
        return Err(BridgeError::OperatorUnknown);
    }

    if let Err(err) = check_operator_status(chain.as_ref()).await {
        warn!("could not check operator sortition pool status: {}", err);
    }

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = ticker.tick() => {
                if let Err(err) = check_operator_status(chain.as_ref()).await {
                    warn!("could not check operator sortition pool status: {}", err);
                }
            }
        }
    }
}

async fn check_operator_status(chain: &dyn Chain) -> Result<()> {
    info!("checking sortition pool operator status");

    let is_in_pool = chain.is_operator_in_pool().await?;
    let is_up_to_date = chain.is_operator_up_to_date().await?;

    if is_in_pool {
        info!("operator is in the sortition pool");
        if let Err(err) = check_rewards_eligibility(chain).await {
            warn!("could not check for rewards eligibility: {}", err);
        }
    } else {
        info!("operator is not in the sortition pool");
    }

    if is_up_to_date {
        if is_in_pool {
            info!("sortition pool operator weight is up to date");
        } else {
            info!("please inspect the staking provider's authorization");
        }
        return Ok(());
    }

    if chain.is_pool_locked().await? {
        info!("sortition pool state is locked, waiting with the update");
        return Ok(());
    }

    if is_in_pool {
        info!("updating operator status in the sortition pool");
        if let Err(err) = chain.update_operator_status().await {
            warn!("could not update the sortition pool: {}", err);
        }
    } else {
        info!("joining the sortition pool");
        if let Err(err) = chain.join_sortition_pool().await {
            warn!("could not join the sortition pool: {}", err);
        }
    }

    Ok(())
}

async fn check_rewards_eligibility(chain: &dyn Chain) -> Result<()> {
    if chain.is_eligible_for_rewards().await? {
        info!("operator is eligible for rewards");
        return Ok(());
    }

    info!("operator is marked as ineligible for rewards");

    if chain.can_restore_reward_eligibility().await? {
        info!("restoring eligibility for rewards");
        chain.restore_reward_eligibility().await?;
    } else {
        info!("cannot restore eligibility for rewards yet");
    }

    Ok(())
}
