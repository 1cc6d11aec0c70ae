use bitcoin::consensus::deserialize;
use bitcoin::{OutPoint, ScriptBuf, Transaction};
use serde::{Deserialize, Serialize};

use super::{
    basic_fee_handling, commit, respond, validate_basic, validate_fee, Context, FeeOutcome, RawTx, Response,
    SignedTx, Tag, Tx, TxType,
};
use crate::chain_driver::parse_multisig_script;
use crate::multisig::BtcMultisig;
use crate::tracker::{Tracker, TrackerEvent};
use crate::types::Address;
use crate::{BridgeError, Result};

/// User request to lock BTC into a tracker's vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub locker: Address,
    pub tracker_name: String,
    /// Lock transaction carrying the user's input signature.
    #[serde(with = "hex")]
    pub btc_txn: Vec<u8>,
    pub lock_amount: u64,
}

impl Lock {
    pub fn signers(&self) -> Vec<Address> {
        vec![self.locker.clone()]
    }

    pub fn tags(&self) -> Vec<Tag> {
        vec![
            Tag::new("tx.type", TxType::Lock),
            Tag::new("tx.locker", &self.locker),
            Tag::new("tx.tracker_name", &self.tracker_name),
        ]
    }
}

/// Checks a lock transaction against the tracker it targets: the vault
/// output (if any) is spent first, output 0 pays the deposit address, and
/// output 0 grows the vault by exactly `lock_amount`.
pub fn check_lock_tx(tracker: &Tracker, tx: &Transaction, lock_amount: u64) -> Result<()> {
    let mismatch = |reason: &str| BridgeError::TxMismatch(format!("{}: {}", tracker.name, reason));

    match tracker.current_utxo() {
        None => {
            if tx.input.len() != 1 {
                return Err(mismatch("first lock must have exactly one input"));
            }
        }
        Some(utxo) => {
            if tx.input.len() != 2 {
                return Err(mismatch("lock must spend the vault and one user input"));
            }
            if tx.input[0].previous_output != OutPoint::new(utxo.txid, utxo.vout) {
                return Err(mismatch("first input must be the vault output"));
            }
        }
    }

    let output = tx.output.first().ok_or_else(|| mismatch("no outputs"))?;
    if output.script_pubkey != ScriptBuf::new_p2sh(&tracker.process_lock_script_address) {
        return Err(mismatch("output 0 must pay the tracker lock script"));
    }
    if lock_amount == 0 || output.value.to_sat() != tracker.current_balance + lock_amount {
        return Err(mismatch("output 0 must equal vault balance plus lock amount"));
    }

    Ok(())
}

/// Collector for a round on `tracker`, signed by the keys of the script
/// guarding the vault input.
pub(crate) fn round_multisig(ctx: &Context, tracker: &Tracker) -> Result<BtcMultisig> {
    let script = ctx.lock_scripts.get_lock_script(&tracker.signing_script_address())?;
    let (m, keys) = parse_multisig_script(&script)?;
    let signers = keys.iter().map(Address::from_btc_pubkey).collect();
    BtcMultisig::new(Vec::new(), m, signers)
}

pub struct BtcLockTx;

impl BtcLockTx {
    fn run(ctx: &Context, raw: &RawTx, deliver: bool) -> Result<Response> {
        let lock: Lock = raw.decode(TxType::Lock)?;
        log::debug!("Lock tx for {}: {}", lock.tracker_name, hex::encode(&lock.btc_txn));

        let tracker = ctx.trackers.get(&lock.tracker_name)?;
        let btc_tx: Transaction = deserialize(&lock.btc_txn)?;
        check_lock_tx(&tracker, &btc_tx, lock.lock_amount)?;

        let multisig = round_multisig(ctx, &tracker)?;
        let (next, effects) = tracker.apply(TrackerEvent::Lock {
            owner: lock.locker.clone(),
            unsigned_tx: lock.btc_txn.clone(),
            process_balance: tracker.current_balance + lock.lock_amount,
            multisig,
        })?;

        let tags = lock.tags();
        let events = commit(ctx, &next, effects, &tags, deliver)?;

        Ok(Response {
            info: format!("tracker: {}", lock.tracker_name),
            tags,
            events,
            ..Default::default()
        })
    }
}

impl Tx for BtcLockTx {
    fn validate(&self, ctx: &Context, signed: &SignedTx) -> Result<bool> {
        let lock: Lock = signed.raw.decode(TxType::Lock)?;
        validate_basic(signed, &lock.signers())?;
        validate_fee(&ctx.fee_opt, &signed.raw.fee)?;

        let tracker = ctx.trackers.get(&lock.tracker_name)?;
        if !tracker.is_available() {
            return Err(BridgeError::TrackerBusy(lock.tracker_name));
        }

        let btc_tx: Transaction = deserialize(&lock.btc_txn)?;
        check_lock_tx(&tracker, &btc_tx, lock.lock_amount)?;
        Ok(true)
    }

    fn process_check(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::Lock, Self::run(ctx, tx, false))
    }

    fn process_deliver(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::Lock, Self::run(ctx, tx, true))
    }

    fn process_fee(&self, ctx: &Context, signed: &SignedTx, gas_start: u64, size: u64) -> FeeOutcome {
        basic_fee_handling(ctx, signed, gas_start, size, 1)
    }
}
