use serde::{Deserialize, Serialize};

use super::{JobContext, JobInfo};
use crate::action::add_signature::AddSignature;
use crate::action::TxType;
use crate::chain_driver::sign_vault_input;
use crate::tracker::{JobKind, Tracker, TrackerState};
use crate::Result;

/// Signs the tracker's pending transaction with this validator's Bitcoin key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSignatureJob {
    pub info: JobInfo,
}

impl AddSignatureJob {
    pub fn new(tracker_name: &str) -> Self {
        Self {
            info: JobInfo::new(JobKind::AddSignature, tracker_name),
        }
    }

    pub async fn do_my_job(&mut self, ctx: &JobContext) {
        if let Err(e) = self.sign_and_submit(ctx).await {
            log::error!("Signing for {} failed: {}", self.info.tracker_name, e);
            self.info.retry_count += 1;
        }
    }

    async fn sign_and_submit(&self, ctx: &JobContext) -> Result<()> {
        let tracker = ctx.trackers.get(&self.info.tracker_name)?;
        if tracker.state != TrackerState::BusySigning || tracker.has_signed(&ctx.signer_address()) {
            return Ok(());
        }
        if !is_round_signer(&tracker, ctx) {
            log::debug!("Not a signer for {} this round", tracker.name);
            return Ok(());
        }

        let redeem_script = match tracker.current_lock_script_address {
            Some(address) if !tracker.is_first_lock() => Some(ctx.lock_scripts.get_lock_script(&address)?),
            _ => None,
        };
        let signature = sign_vault_input(&tracker.process_unsigned_tx, redeem_script.as_deref(), &ctx.btc_key)?;

        let add = AddSignature {
            tracker_name: tracker.name.clone(),
            validator_pub_key: ctx.btc_pubkey().to_bytes(),
            btc_signature: signature,
            validator_address: ctx.validator_address.clone(),
        };
        ctx.submit(TxType::AddSignature, &add, &self.info.job_id).await?;

        log::info!("Submitted signature for {}", tracker.name);
        Ok(())
    }

    pub fn is_my_job_done(&self, ctx: &JobContext) -> bool {
        match ctx.trackers.get(&self.info.tracker_name) {
            Ok(tracker) => {
                tracker.state != TrackerState::BusySigning
                    || tracker.has_signed(&ctx.signer_address())
                    || !is_round_signer(&tracker, ctx)
            }
            Err(_) => false,
        }
    }

    pub fn is_sufficient(&self, ctx: &JobContext) -> bool {
        ctx.trackers
            .get(&self.info.tracker_name)
            .map(|t| t.has_enough_signatures())
            .unwrap_or(false)
    }
}

fn is_round_signer(tracker: &Tracker, ctx: &JobContext) -> bool {
    tracker
        .multisig
        .as_ref()
        .map_or(false, |ms| ms.get_signer_index(&ctx.signer_address()).is_ok())
}
