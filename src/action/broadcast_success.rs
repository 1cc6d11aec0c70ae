use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use super::{commit, respond, validate_basic, Context, FeeOutcome, RawTx, Response, SignedTx, Tag, Tx, TxType};
use crate::tracker::TrackerEvent;
use crate::types::Address;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSuccess {
    pub tracker_name: String,
    pub validator_address: Address,
    pub btc_tx_id: Txid,
}

impl BroadcastSuccess {
    pub fn signers(&self) -> Vec<Address> {
        vec![self.validator_address.clone()]
    }

    pub fn tags(&self) -> Vec<Tag> {
        vec![
            Tag::new("tx.type", TxType::BroadcastSuccess),
            Tag::new("tx.validator", &self.validator_address),
            Tag::new("tx.tracker_name", &self.tracker_name),
        ]
    }
}

pub struct BtcBroadcastSuccessTx;

impl BtcBroadcastSuccessTx {
    fn run(ctx: &Context, raw: &RawTx, deliver: bool) -> Result<Response> {
        let report: BroadcastSuccess = raw.decode(TxType::BroadcastSuccess)?;
        ctx.require_validator(&report.validator_address)?;

        let tracker = ctx.trackers.get(&report.tracker_name)?;
        let (next, effects) = tracker.apply(TrackerEvent::BroadcastSuccess {
            txid: report.btc_tx_id,
        })?;

        log::info!("Tracker {} broadcast {}", report.tracker_name, report.btc_tx_id);

        let tags = report.tags();
        let events = commit(ctx, &next, effects, &tags, deliver)?;

        Ok(Response {
            tags,
            events,
            ..Default::default()
        })
    }
}

impl Tx for BtcBroadcastSuccessTx {
    fn validate(&self, ctx: &Context, signed: &SignedTx) -> Result<bool> {
        let report: BroadcastSuccess = signed.raw.decode(TxType::BroadcastSuccess)?;
        validate_basic(signed, &report.signers())?;
        ctx.require_validator(&report.validator_address)?;
        ctx.trackers.get(&report.tracker_name)?;
        Ok(true)
    }

    fn process_check(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::BroadcastSuccess, Self::run(ctx, tx, false))
    }

    fn process_deliver(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::BroadcastSuccess, Self::run(ctx, tx, true))
    }

    fn process_fee(&self, _ctx: &Context, _signed: &SignedTx, _gas_start: u64, _size: u64) -> FeeOutcome {
        FeeOutcome::NotApplicable
    }
}
