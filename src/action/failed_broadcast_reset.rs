use serde::{Deserialize, Serialize};

use super::{commit, respond, validate_basic, Context, FeeOutcome, RawTx, Response, SignedTx, Tag, Tx, TxType};
use crate::multisig::threshold_for;
use crate::tracker::{Effect, TrackerEvent, TrackerState, EVENT_RESET_COMPLETE};
use crate::types::Address;
use crate::{BridgeError, Result};

/// A validator's vote to abandon a transaction that could not be broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBroadcastReset {
    pub tracker_name: String,
    pub validator_address: Address,
}

impl FailedBroadcastReset {
    pub fn signers(&self) -> Vec<Address> {
        vec![self.validator_address.clone()]
    }

    pub fn tags(&self) -> Vec<Tag> {
        vec![
            Tag::new("tx.type", TxType::FailedBroadcastReset),
            Tag::new("tx.validator", &self.validator_address),
            Tag::new("tx.tracker_name", &self.tracker_name),
        ]
    }

    pub fn tags_failed(&self) -> Vec<Tag> {
        let mut tags = self.tags();
        tags.push(Tag::new("tx.lock_redeem_status", "failure"));
        tags
    }
}

pub struct BtcFailedBroadcastResetTx;

impl BtcFailedBroadcastResetTx {
    fn run(ctx: &Context, raw: &RawTx, deliver: bool) -> Result<Response> {
        let reset: FailedBroadcastReset = raw.decode(TxType::FailedBroadcastReset)?;
        ctx.require_validator(&reset.validator_address)?;

        let tracker = ctx.trackers.get(&reset.tracker_name)?;
        let quorum = threshold_for(ctx.validators.get_validator_set()?.len());

        let (next, effects) = tracker.apply(TrackerEvent::ResetVote {
            validator: reset.validator_address.clone(),
            quorum,
        })?;

        let tags = if effects.contains(&Effect::Emit(EVENT_RESET_COMPLETE)) {
            log::warn!("Tracker {} reset after failed broadcast", reset.tracker_name);
            reset.tags_failed()
        } else {
            log::debug!(
                "Reset vote {} of {} for {}",
                next.reset_votes.len(),
                quorum,
                reset.tracker_name
            );
            reset.tags()
        };
        let events = commit(ctx, &next, effects, &tags, deliver)?;

        Ok(Response {
            tags,
            events,
            ..Default::default()
        })
    }
}

impl Tx for BtcFailedBroadcastResetTx {
    fn validate(&self, ctx: &Context, signed: &SignedTx) -> Result<bool> {
        let reset: FailedBroadcastReset = signed.raw.decode(TxType::FailedBroadcastReset)?;
        validate_basic(signed, &reset.signers())?;
        ctx.require_validator(&reset.validator_address)?;

        let tracker = ctx.trackers.get(&reset.tracker_name)?;
        if tracker.state != TrackerState::BusyBroadcasting {
            return Err(BridgeError::InvalidStateTransition {
                tracker: reset.tracker_name,
                action: "reset",
                state: tracker.state,
            });
        }
        Ok(true)
    }

    fn process_check(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::FailedBroadcastReset, Self::run(ctx, tx, false))
    }

    fn process_deliver(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::FailedBroadcastReset, Self::run(ctx, tx, true))
    }

    fn process_fee(&self, _ctx: &Context, _signed: &SignedTx, _gas_start: u64, _size: u64) -> FeeOutcome {
        FeeOutcome::NotApplicable
    }
}
