use bitcoin::consensus::{deserialize, encode::serialize_hex};
use bitcoin::{ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};

use super::{JobContext, JobInfo};
use crate::action::broadcast_success::BroadcastSuccess;
use crate::action::failed_broadcast_reset::FailedBroadcastReset;
use crate::action::report_finality_mint::ReportFinalityMint;
use crate::action::TxType;
use crate::chain_driver::{build_sig_script, MULTISIG_RANDOMNESS_LEN};
use crate::tracker::{JobKind, ProcessType, Tracker, TrackerState};
use crate::{BridgeError, Result};

/// Assembles and broadcasts the signed transaction, then follows it to
/// finality and casts this validator's finality vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastJob {
    pub info: JobInfo,
    pub broadcast_txid: Option<Txid>,
    pub success_reported: bool,
    pub reset_submitted: bool,
}

impl BroadcastJob {
    pub fn new(tracker_name: &str) -> Self {
        Self {
            info: JobInfo::new(JobKind::Broadcast, tracker_name),
            broadcast_txid: None,
            success_reported: false,
            reset_submitted: false,
        }
    }

    pub async fn do_my_job(&mut self, ctx: &JobContext) {
        let tracker = match ctx.trackers.get(&self.info.tracker_name) {
            Ok(tracker) => tracker,
            Err(e) => {
                log::error!("Failed to load tracker {}: {}", self.info.tracker_name, e);
                self.info.retry_count += 1;
                return;
            }
        };

        match tracker.state {
            TrackerState::BusyBroadcasting => self.broadcast(ctx, &tracker).await,
            TrackerState::BusySigning if tracker.has_enough_signatures() => self.broadcast(ctx, &tracker).await,
            TrackerState::BusyFinalizing => self.vote_finality(ctx, &tracker).await,
            _ => {}
        }
    }

    async fn broadcast(&mut self, ctx: &JobContext, tracker: &Tracker) {
        if self.reset_submitted {
            return;
        }

        if self.broadcast_txid.is_none() {
            match self.send(ctx, tracker) {
                Ok(txid) => {
                    log::info!("Bitcoin tx {} broadcast for {}", txid, tracker.name);
                    self.broadcast_txid = Some(txid);
                }
                Err(e) => {
                    self.info.retry_count += 1;
                    log::error!(
                        "Broadcast for {} failed ({}/{}): {}",
                        tracker.name,
                        self.info.retry_count,
                        ctx.max_broadcast_retries,
                        e
                    );
                    if self.info.retry_count >= ctx.max_broadcast_retries {
                        self.submit_reset(ctx, tracker).await;
                    }
                    return;
                }
            }
        }

        if let (Some(txid), false) = (self.broadcast_txid, self.success_reported) {
            let report = BroadcastSuccess {
                tracker_name: tracker.name.clone(),
                validator_address: ctx.validator_address.clone(),
                btc_tx_id: txid,
            };
            match ctx.submit(TxType::BroadcastSuccess, &report, &self.info.job_id).await {
                Ok(()) => self.success_reported = true,
                Err(e) => log::error!("Failed to report broadcast for {}: {}", tracker.name, e),
            }
        }
    }

    fn send(&self, ctx: &JobContext, tracker: &Tracker) -> Result<Txid> {
        let unsigned = &tracker.process_unsigned_tx;
        let tx: Transaction = if tracker.is_first_lock() {
            deserialize(unsigned)?
        } else if tracker.process_type == ProcessType::Redeem {
            ctx.chain_driver.add_redeem_signature(unsigned, self.sig_script(ctx, tracker)?)?
        } else {
            ctx.chain_driver.add_lock_signature(unsigned, self.sig_script(ctx, tracker)?)?
        };
        log::debug!("Final tx for {}: {}", tracker.name, serialize_hex(&tx));
        ctx.chain_driver.broadcast_tx(&tx, ctx.bitcoin.as_ref())
    }

    fn sig_script(&self, ctx: &JobContext, tracker: &Tracker) -> Result<ScriptBuf> {
        let multisig = tracker
            .multisig
            .as_ref()
            .ok_or_else(|| BridgeError::MultisigMissing(tracker.name.clone()))?;
        let address = tracker
            .current_lock_script_address
            .ok_or_else(|| BridgeError::TxMismatch(format!("{} holds no vault output", tracker.name)))?;
        let redeem_script = ctx.lock_scripts.get_lock_script(&address)?;
        build_sig_script(&multisig.threshold_signatures(), multisig.m, &redeem_script)
    }

    async fn submit_reset(&mut self, ctx: &JobContext, tracker: &Tracker) {
        let reset = FailedBroadcastReset {
            tracker_name: tracker.name.clone(),
            validator_address: ctx.validator_address.clone(),
        };
        match ctx.submit(TxType::FailedBroadcastReset, &reset, &self.info.job_id).await {
            Ok(()) => {
                log::warn!("Gave up broadcasting for {}, voted reset", tracker.name);
                self.reset_submitted = true;
            }
            Err(e) => log::error!("Failed to submit reset for {}: {}", tracker.name, e),
        }
    }

    async fn vote_finality(&mut self, ctx: &JobContext, tracker: &Tracker) {
        if tracker.has_voted_finality(&ctx.validator_address) {
            return;
        }
        let (Some(txid), Some(owner)) = (tracker.process_tx_id, tracker.process_owner.clone()) else {
            log::error!("Tracker {} is finalizing without a transaction", tracker.name);
            return;
        };

        match ctx.chain_driver.check_finality(&txid, ctx.explorer.as_ref()).await {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("{} not final yet", txid);
                return;
            }
            Err(e) => {
                log::warn!("Finality check for {} failed: {}", txid, e);
                return;
            }
        }

        let report = ReportFinalityMint {
            tracker_name: tracker.name.clone(),
            validator_address: ctx.validator_address.clone(),
            owner_address: owner,
            random_bytes: rand::random::<[u8; MULTISIG_RANDOMNESS_LEN]>().to_vec(),
        };
        match ctx.submit(TxType::ReportFinalityMint, &report, &self.info.job_id).await {
            Ok(()) => log::info!("Voted finality for {} on {}", tracker.name, txid),
            Err(e) => log::error!("Failed to submit finality vote for {}: {}", tracker.name, e),
        }
    }

    pub fn is_my_job_done(&self, ctx: &JobContext) -> bool {
        if self.reset_submitted {
            return true;
        }
        match ctx.trackers.get(&self.info.tracker_name) {
            Ok(tracker) => tracker.is_available() || tracker.has_voted_finality(&ctx.validator_address),
            Err(_) => false,
        }
    }
}
