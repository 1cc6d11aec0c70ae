use serde::{Deserialize, Serialize};

use super::{commit, respond, validate_basic, Context, FeeOutcome, RawTx, Response, SignedTx, Tag, Tx, TxType};
use crate::chain_driver::{create_multisig_address, MULTISIG_RANDOMNESS_LEN};
use crate::multisig::threshold_for;
use crate::tracker::{Effect, NextVault, TrackerEvent, TrackerState, EVENT_FINALITY_COMPLETE};
use crate::types::Address;
use crate::{BridgeError, Result};

/// A validator's report that the tracker's transaction reached finality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFinalityMint {
    pub tracker_name: String,
    pub validator_address: Address,
    pub owner_address: Address,
    /// Salt for the tracker's next multisig address.
    #[serde(with = "hex")]
    pub random_bytes: Vec<u8>,
}

impl ReportFinalityMint {
    pub fn signers(&self) -> Vec<Address> {
        vec![self.validator_address.clone()]
    }

    pub fn tags(&self) -> Vec<Tag> {
        vec![
            Tag::new("tx.type", TxType::ReportFinalityMint),
            Tag::new("tx.validator", &self.validator_address),
            Tag::new("tx.owner", &self.owner_address),
            Tag::new("tx.tracker_name", &self.tracker_name),
        ]
    }
}

pub struct BtcReportFinalityMintTx;

impl BtcReportFinalityMintTx {
    fn run(ctx: &Context, raw: &RawTx, deliver: bool) -> Result<Response> {
        let report: ReportFinalityMint = raw.decode(TxType::ReportFinalityMint)?;
        ctx.require_validator(&report.validator_address)?;

        let tracker = ctx.trackers.get(&report.tracker_name)?;

        let validator_keys = ctx.validators.get_bitcoin_keys()?;
        let quorum = threshold_for(validator_keys.len());
        let (script, address, _) = create_multisig_address(quorum, &validator_keys, &report.random_bytes)?;

        let (next, effects) = tracker.apply(TrackerEvent::FinalityVote {
            validator: report.validator_address.clone(),
            owner: report.owner_address.clone(),
            quorum,
            next_vault: NextVault { script, address },
        })?;

        let mut tags = report.tags();
        if effects.contains(&Effect::Emit(EVENT_FINALITY_COMPLETE)) {
            log::info!(
                "Tracker {} finalized at {} sat, next address {}",
                report.tracker_name,
                next.current_balance,
                next.process_lock_script_address
            );
            tags.push(Tag::new("tx.lock_redeem_status", "success"));
        }
        let events = commit(ctx, &next, effects, &tags, deliver)?;

        Ok(Response {
            tags,
            events,
            ..Default::default()
        })
    }
}

impl Tx for BtcReportFinalityMintTx {
    fn validate(&self, ctx: &Context, signed: &SignedTx) -> Result<bool> {
        let report: ReportFinalityMint = signed.raw.decode(TxType::ReportFinalityMint)?;
        validate_basic(signed, &report.signers())?;
        ctx.require_validator(&report.validator_address)?;
        if report.random_bytes.len() != MULTISIG_RANDOMNESS_LEN {
            return Err(BridgeError::InvalidScript(format!(
                "random bytes must be {} bytes, got {}",
                MULTISIG_RANDOMNESS_LEN,
                report.random_bytes.len()
            )));
        }

        let tracker = ctx.trackers.get(&report.tracker_name)?;
        if tracker.process_owner.as_ref() != Some(&report.owner_address) {
            return Err(BridgeError::NotProcessOwner(report.owner_address.to_string()));
        }
        if tracker.state != TrackerState::BusyFinalizing {
            return Err(BridgeError::InvalidStateTransition {
                tracker: report.tracker_name,
                action: "finalize",
                state: tracker.state,
            });
        }
        Ok(true)
    }

    fn process_check(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::ReportFinalityMint, Self::run(ctx, tx, false))
    }

    fn process_deliver(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::ReportFinalityMint, Self::run(ctx, tx, true))
    }

    fn process_fee(&self, _ctx: &Context, _signed: &SignedTx, _gas_start: u64, _size: u64) -> FeeOutcome {
        FeeOutcome::NotApplicable
    }
}
