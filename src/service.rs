/// User-facing bridge service
///
/// Prepares unsigned lock and redeem transactions against the best tracker,
/// then turns the user's signed transaction into a Lock or Redeem ledger
/// transaction. Everything here runs off the consensus path, so it may talk to
/// the block explorer.

use std::sync::Arc;

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::{Script, ScriptBuf, Transaction, Txid};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::action::lock::{check_lock_tx, Lock};
use crate::action::redeem::{check_redeem_tx, Redeem};
use crate::action::{Fee, RawTx, TxType};
use crate::bitcoin_client::ConfirmationSource;
use crate::chain_driver::ChainDriver;
use crate::store::{LockScriptStore, TrackerStore};
use crate::tracker::Tracker;
use crate::types::{Address, Utxo};
use crate::{BridgeError, Result};

pub const MIN_FUNDING_CONFIRMATIONS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTx {
    #[serde(with = "hex")]
    pub txn: Vec<u8>,
    pub tracker_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub address: Address,
    pub tracker_name: String,
    #[serde(with = "hex")]
    pub txn: Vec<u8>,
    /// The user's unlocking script for their funding input.
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
    pub fee: Fee,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemRequest {
    pub address: Address,
    pub tracker_name: String,
    #[serde(with = "hex")]
    pub txn: Vec<u8>,
    pub redeem_amount: u64,
    pub fee: Fee,
}

pub struct BridgeService {
    trackers: TrackerStore,
    lock_scripts: Arc<dyn LockScriptStore>,
    chain_driver: ChainDriver,
    explorer: Arc<dyn ConfirmationSource>,
}

impl BridgeService {
    pub fn new(
        trackers: TrackerStore,
        lock_scripts: Arc<dyn LockScriptStore>,
        chain_driver: ChainDriver,
        explorer: Arc<dyn ConfirmationSource>,
    ) -> Self {
        Self {
            trackers,
            lock_scripts,
            chain_driver,
            explorer,
        }
    }

    /// Builds a lock of the user's output `txid:vout` into the available
    /// tracker with the lowest balance.
    pub async fn prepare_lock(&self, txid: Txid, vout: u32) -> Result<PreparedTx> {
        let funding = self.explorer.get_tx(&txid).await?;
        if funding.confirmations < MIN_FUNDING_CONFIRMATIONS {
            return Err(BridgeError::NotEnoughConfirmations {
                required: MIN_FUNDING_CONFIRMATIONS,
                actual: funding.confirmations,
            });
        }
        let output = funding.output(vout)?;
        if output.spent_by.is_some() {
            return Err(BridgeError::TxMismatch(format!("{}:{} is already spent", txid, vout)));
        }

        let tracker = self.trackers.get_tracker_for_lock()?;
        let input = Utxo::new(txid, vout, output.value);
        let txn = self.chain_driver.prepare_lock(
            tracker.current_utxo().as_ref(),
            &input,
            &tracker.process_lock_script_address,
        )?;

        log::info!("Prepared lock of {} sat into {}", output.value, tracker.name);
        Ok(PreparedTx {
            txn,
            tracker_name: tracker.name,
        })
    }

    /// Builds a redeem of `amount` sat to `user_script` from the funded
    /// tracker with the highest balance.
    pub fn prepare_redeem(&self, user_script: &Script, amount: u64) -> Result<PreparedTx> {
        let tracker = self.trackers.get_tracker_for_redeem(amount)?;
        let vault = tracker
            .current_utxo()
            .ok_or_else(|| BridgeError::TxMismatch(format!("{} holds no vault output", tracker.name)))?;

        let vault_script = self.vault_script(&tracker)?;
        let fee = self.chain_driver.redeem_fee(
            &vault,
            user_script,
            &tracker.process_lock_script_address,
            &vault_script,
        )?;
        let txn = self.chain_driver.prepare_redeem(
            &vault,
            user_script,
            amount,
            fee,
            &tracker.process_lock_script_address,
        )?;

        log::info!("Prepared redeem of {} sat from {} (fee {} sat)", amount, tracker.name, fee);
        Ok(PreparedTx {
            txn,
            tracker_name: tracker.name,
        })
    }

    pub async fn add_user_signature_and_process_lock(&self, request: LockRequest) -> Result<RawTx> {
        let tracker = self.available_tracker(&request.tracker_name)?;
        let tx = self
            .chain_driver
            .add_user_lock_signature(&request.txn, ScriptBuf::from(request.signature.clone()))?;

        let vault_output = tx
            .output
            .first()
            .map(|o| o.value.to_sat())
            .ok_or_else(|| BridgeError::TxMismatch("lock has no outputs".to_string()))?;
        let lock_amount = vault_output
            .checked_sub(tracker.current_balance)
            .ok_or_else(|| BridgeError::TxMismatch("lock shrinks the vault".to_string()))?;
        check_lock_tx(&tracker, &tx, lock_amount)?;

        let input_total = self.spendable_input_total(&tx).await?;
        if input_total < vault_output {
            return Err(BridgeError::InsufficientFunds {
                required: vault_output,
                available: input_total,
            });
        }

        let lock = Lock {
            locker: request.address,
            tracker_name: tracker.name.clone(),
            btc_txn: serialize(&tx),
            lock_amount,
        };
        RawTx::new(TxType::Lock, &lock, request.fee, &memo(&tracker))
    }

    /// A redeem spends only the vault, so there is no user input to sign; the
    /// transaction is checked against the chain and wrapped as is.
    pub async fn add_user_signature_and_process_redeem(&self, request: RedeemRequest) -> Result<RawTx> {
        let tracker = self.available_tracker(&request.tracker_name)?;
        let tx: Transaction = deserialize(&request.txn)?;
        check_redeem_tx(&tracker, &tx, request.redeem_amount)?;

        let input_total = self.spendable_input_total(&tx).await?;
        if input_total != tracker.current_balance {
            return Err(BridgeError::TxMismatch(format!(
                "vault output holds {} sat, tracker records {}",
                input_total, tracker.current_balance
            )));
        }
        let vault_script = self.vault_script(&tracker)?;
        if !self.chain_driver.fee_rate_within_bounds(&tx, input_total, Some(&vault_script)) {
            return Err(BridgeError::Fee("redeem fee rate out of bounds".to_string()));
        }

        let redeem = Redeem {
            redeemer: request.address,
            tracker_name: tracker.name.clone(),
            btc_txn: request.txn,
            redeem_amount: request.redeem_amount,
        };
        RawTx::new(TxType::Redeem, &redeem, request.fee, &memo(&tracker))
    }

    fn available_tracker(&self, name: &str) -> Result<Tracker> {
        let tracker = self.trackers.get(name)?;
        if tracker.is_busy() {
            return Err(BridgeError::TrackerBusy(tracker.name));
        }
        Ok(tracker)
    }

    /// Script guarding the tracker's current vault output.
    fn vault_script(&self, tracker: &Tracker) -> Result<ScriptBuf> {
        let address = tracker
            .current_lock_script_address
            .ok_or_else(|| BridgeError::TxMismatch(format!("{} holds no vault output", tracker.name)))?;
        self.lock_scripts.get_lock_script(&address)
    }

    /// Sum of the outputs `tx` spends, each of which must exist and be unspent.
    async fn spendable_input_total(&self, tx: &Transaction) -> Result<u64> {
        let mut total = 0;
        for input in &tx.input {
            let prev = input.previous_output;
            let funding = self.explorer.get_tx(&prev.txid).await?;
            let output = funding.output(prev.vout)?;
            if output.spent_by.is_some() {
                return Err(BridgeError::TxMismatch(format!("{} is already spent", prev)));
            }
            total += output.value;
        }
        Ok(total)
    }
}

fn memo(tracker: &Tracker) -> String {
    format!("{}-{}", tracker.name, Utc::now().timestamp_millis())
}
