use bitcoin::consensus::deserialize;
use bitcoin::{OutPoint, ScriptBuf, Transaction};
use serde::{Deserialize, Serialize};

use super::lock::round_multisig;
use super::{
    basic_fee_handling, commit, respond, validate_basic, validate_fee, Context, FeeOutcome, RawTx, Response,
    SignedTx, Tag, Tx, TxType,
};
use crate::tracker::{Tracker, TrackerEvent};
use crate::types::Address;
use crate::{BridgeError, Result};

/// User request to burn wrapped BTC and receive BTC from a tracker's vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redeem {
    pub redeemer: Address,
    pub tracker_name: String,
    #[serde(with = "hex")]
    pub btc_txn: Vec<u8>,
    pub redeem_amount: u64,
}

impl Redeem {
    pub fn signers(&self) -> Vec<Address> {
        vec![self.redeemer.clone()]
    }

    pub fn tags(&self) -> Vec<Tag> {
        vec![
            Tag::new("tx.type", TxType::Redeem),
            Tag::new("tx.owner", &self.redeemer),
            Tag::new("tx.tracker_name", &self.tracker_name),
        ]
    }
}

/// A redeem spends only the vault output and returns the remainder to the
/// tracker's deposit address in output 0.
pub fn check_redeem_tx(tracker: &Tracker, tx: &Transaction, redeem_amount: u64) -> Result<()> {
    let mismatch = |reason: &str| BridgeError::TxMismatch(format!("{}: {}", tracker.name, reason));

    let utxo = tracker
        .current_utxo()
        .ok_or_else(|| mismatch("tracker holds no vault output"))?;

    if redeem_amount == 0 || redeem_amount > utxo.balance {
        return Err(BridgeError::InsufficientFunds {
            required: redeem_amount,
            available: utxo.balance,
        });
    }
    if tx.input.len() != 1 || tx.input[0].previous_output != OutPoint::new(utxo.txid, utxo.vout) {
        return Err(mismatch("redeem must spend only the vault output"));
    }
    if tx.output.len() != 2 {
        return Err(mismatch("redeem must have two outputs"));
    }
    if tx.output[0].script_pubkey != ScriptBuf::new_p2sh(&tracker.process_lock_script_address) {
        return Err(mismatch("output 0 must pay the tracker lock script"));
    }
    if tx.output[0].value.to_sat() != utxo.balance - redeem_amount {
        return Err(mismatch("output 0 must hold the remaining vault balance"));
    }

    Ok(())
}

pub struct BtcRedeemTx;

impl BtcRedeemTx {
    fn run(ctx: &Context, raw: &RawTx, deliver: bool) -> Result<Response> {
        let redeem: Redeem = raw.decode(TxType::Redeem)?;
        log::debug!("Redeem tx for {}: {}", redeem.tracker_name, hex::encode(&redeem.btc_txn));

        let tracker = ctx.trackers.get(&redeem.tracker_name)?;
        let btc_tx: Transaction = deserialize(&redeem.btc_txn)?;
        check_redeem_tx(&tracker, &btc_tx, redeem.redeem_amount)?;

        let multisig = round_multisig(ctx, &tracker)?;
        let (next, effects) = tracker.apply(TrackerEvent::Redeem {
            owner: redeem.redeemer.clone(),
            unsigned_tx: redeem.btc_txn.clone(),
            process_balance: tracker.current_balance - redeem.redeem_amount,
            redeem_amount: redeem.redeem_amount,
            multisig,
        })?;

        let tags = redeem.tags();
        let events = commit(ctx, &next, effects, &tags, deliver)?;

        Ok(Response {
            info: format!("tracker: {}", redeem.tracker_name),
            tags,
            events,
            ..Default::default()
        })
    }
}

impl Tx for BtcRedeemTx {
    fn validate(&self, ctx: &Context, signed: &SignedTx) -> Result<bool> {
        let redeem: Redeem = signed.raw.decode(TxType::Redeem)?;
        validate_basic(signed, &redeem.signers())?;
        validate_fee(&ctx.fee_opt, &signed.raw.fee)?;

        let tracker = ctx.trackers.get(&redeem.tracker_name)?;
        if !tracker.is_available() {
            return Err(BridgeError::TrackerBusy(redeem.tracker_name));
        }

        let btc_tx: Transaction = deserialize(&redeem.btc_txn)?;
        check_redeem_tx(&tracker, &btc_tx, redeem.redeem_amount)?;
        Ok(true)
    }

    fn process_check(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::Redeem, Self::run(ctx, tx, false))
    }

    fn process_deliver(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::Redeem, Self::run(ctx, tx, true))
    }

    fn process_fee(&self, ctx: &Context, signed: &SignedTx, gas_start: u64, size: u64) -> FeeOutcome {
        basic_fee_handling(ctx, signed, gas_start, size, 1)
    }
}
