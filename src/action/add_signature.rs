use serde::{Deserialize, Serialize};

use super::{commit, respond, validate_basic, Context, FeeOutcome, RawTx, Response, SignedTx, Tag, Tx, TxType};
use crate::chain_driver::verify_vault_signature;
use crate::tracker::{TrackerEvent, TrackerState};
use crate::types::Address;
use crate::{BridgeError, Result};

/// A validator's partial signature for a tracker's pending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSignature {
    pub tracker_name: String,
    #[serde(with = "hex")]
    pub validator_pub_key: Vec<u8>,
    #[serde(with = "hex")]
    pub btc_signature: Vec<u8>,
    pub validator_address: Address,
}

impl AddSignature {
    pub fn signers(&self) -> Vec<Address> {
        vec![self.validator_address.clone()]
    }

    pub fn tags(&self) -> Vec<Tag> {
        vec![
            Tag::new("tx.type", TxType::AddSignature),
            Tag::new("tx.validator", &self.validator_address),
            Tag::new("tx.tracker_name", &self.tracker_name),
        ]
    }
}

pub struct BtcAddSignatureTx;

impl BtcAddSignatureTx {
    fn run(ctx: &Context, raw: &RawTx, deliver: bool) -> Result<Response> {
        let add: AddSignature = raw.decode(TxType::AddSignature)?;
        ctx.require_validator(&add.validator_address)?;

        let tracker = ctx.trackers.get(&add.tracker_name)?;
        if tracker.state != TrackerState::BusySigning {
            return Err(BridgeError::NotCollectingSignatures);
        }

        let pubkey = bitcoin::PublicKey::from_slice(&add.validator_pub_key)
            .map_err(|e| BridgeError::KeyParseError(e.to_string()))?;
        let registered = ctx
            .validators
            .get_validator_set()?
            .into_iter()
            .any(|v| v.address == add.validator_address && v.btc_pubkey == pubkey);
        if !registered {
            return Err(BridgeError::InvalidSignature(format!(
                "{} is not the bitcoin key of {}",
                pubkey, add.validator_address
            )));
        }

        let redeem_script = match tracker.current_lock_script_address {
            Some(address) if !tracker.is_first_lock() => Some(ctx.lock_scripts.get_lock_script(&address)?),
            _ => None,
        };
        verify_vault_signature(
            &tracker.process_unsigned_tx,
            redeem_script.as_deref(),
            &pubkey,
            &add.btc_signature,
        )?;

        let (next, effects) = tracker.apply(TrackerEvent::AddSignature {
            signer: Address::from_btc_pubkey(&pubkey),
            signature: add.btc_signature.clone(),
        })?;

        if next.state == TrackerState::BusyBroadcasting {
            log::info!("Tracker {} collected enough signatures", add.tracker_name);
        }

        let tags = add.tags();
        let events = commit(ctx, &next, effects, &tags, deliver)?;

        Ok(Response {
            tags,
            events,
            ..Default::default()
        })
    }
}

impl Tx for BtcAddSignatureTx {
    fn validate(&self, ctx: &Context, signed: &SignedTx) -> Result<bool> {
        let add: AddSignature = signed.raw.decode(TxType::AddSignature)?;
        validate_basic(signed, &add.signers())?;
        ctx.require_validator(&add.validator_address)?;

        let tracker = ctx.trackers.get(&add.tracker_name)?;
        if tracker.state != TrackerState::BusySigning {
            return Err(BridgeError::NotCollectingSignatures);
        }
        Ok(true)
    }

    fn process_check(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::AddSignature, Self::run(ctx, tx, false))
    }

    fn process_deliver(&self, ctx: &Context, tx: &RawTx) -> (bool, Response) {
        respond(TxType::AddSignature, Self::run(ctx, tx, true))
    }

    fn process_fee(&self, _ctx: &Context, _signed: &SignedTx, _gas_start: u64, _size: u64) -> FeeOutcome {
        FeeOutcome::NotApplicable
    }
}
