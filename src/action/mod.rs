/// Ledger transaction pipeline contract and the bridge handlers
///
/// Every bridge transaction goes through the same four steps:
/// `validate` (stateless checks plus tracker existence), `process_check`
/// (a dry run of the tracker transition), `process_fee`, and finally
/// `process_deliver`, which persists the transition. The fee is charged
/// before anything is persisted and refunded if the deliver step fails.

pub mod add_signature;
pub mod broadcast_success;
pub mod failed_broadcast_reset;
pub mod lock;
pub mod redeem;
pub mod report_finality_mint;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chain_driver::ChainDriver;
use crate::config::BridgeConfig;
use crate::jobs::{Job, JobStore};
use crate::store::{LockScriptStore, TrackerStore};
use crate::tracker::{Effect, Tracker};
use crate::types::{Address, Coin, Currency};
use crate::{BridgeError, Result};

pub const BTC_CURRENCY: &str = "BTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    Lock,
    AddSignature,
    BroadcastSuccess,
    ReportFinalityMint,
    Redeem,
    FailedBroadcastReset,
}

impl TxType {
    pub const ALL: [TxType; 6] = [
        TxType::Lock,
        TxType::AddSignature,
        TxType::BroadcastSuccess,
        TxType::ReportFinalityMint,
        TxType::Redeem,
        TxType::FailedBroadcastReset,
    ];

    pub fn code(&self) -> u16 {
        match self {
            TxType::Lock => 0x81,
            TxType::AddSignature => 0x82,
            TxType::BroadcastSuccess => 0x83,
            TxType::ReportFinalityMint => 0x84,
            TxType::Redeem => 0x85,
            TxType::FailedBroadcastReset => 0x86,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Lock => "BTC_LOCK",
            TxType::AddSignature => "BTC_ADD_SIGNATURE",
            TxType::BroadcastSuccess => "BTC_BROADCAST_SUCCESS",
            TxType::ReportFinalityMint => "BTC_REPORT_FINALITY_MINT",
            TxType::Redeem => "BTC_REDEEM",
            TxType::FailedBroadcastReset => "BTC_FAILED_BROADCAST_RESET",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub price: Coin,
    pub gas: u64,
}

impl Fee {
    /// Fee for validator-submitted transactions, which are never charged.
    pub fn none() -> Self {
        Self {
            price: Coin {
                currency: String::new(),
                amount: 0,
            },
            gas: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeOpt {
    pub fee_currency: Currency,
    pub min_gas_price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTx {
    pub tx_type: TxType,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
    pub fee: Fee,
    pub memo: String,
}

impl RawTx {
    pub fn new<T: Serialize>(tx_type: TxType, msg: &T, fee: Fee, memo: &str) -> Result<Self> {
        Ok(Self {
            tx_type,
            data: serde_json::to_vec(msg)?,
            fee,
            memo: memo.to_string(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, expected: TxType) -> Result<T> {
        if self.tx_type != expected {
            return Err(BridgeError::WrongTxType(format!(
                "expected {}, got {}",
                expected, self.tx_type
            )));
        }
        serde_json::from_slice(&self.data).map_err(|e| BridgeError::WrongTxType(e.to_string()))
    }

    pub fn sign_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    /// Compressed secp256k1 key of the signer.
    #[serde(with = "hex")]
    pub signer: Vec<u8>,
    /// Compact ECDSA signature over `sha256(raw tx bytes)`.
    #[serde(with = "hex")]
    pub signed: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub raw: RawTx,
    pub signatures: Vec<TxSignature>,
}

fn tx_digest(raw: &RawTx) -> Result<Message> {
    let digest: [u8; 32] = Sha256::digest(raw.sign_bytes()?).into();
    Ok(Message::from_digest(digest))
}

impl SignedTx {
    pub fn sign(raw: RawTx, keys: &[SecretKey]) -> Result<Self> {
        let secp = Secp256k1::new();
        let msg = tx_digest(&raw)?;

        let signatures = keys
            .iter()
            .map(|key| TxSignature {
                signer: PublicKey::from_secret_key(&secp, key).serialize().to_vec(),
                signed: secp.sign_ecdsa(&msg, key).serialize_compact().to_vec(),
            })
            .collect();

        Ok(Self { raw, signatures })
    }

    /// Serialized size, the base for fee calculation.
    pub fn size(&self) -> Result<u64> {
        Ok(serde_json::to_vec(self)?.len() as u64)
    }

    pub fn first_signer(&self) -> Result<Address> {
        let sig = self
            .signatures
            .first()
            .ok_or_else(|| BridgeError::MissingSignature("transaction is unsigned".to_string()))?;
        Ok(Address::from_pubkey(&PublicKey::from_slice(&sig.signer)?))
    }
}

/// Checks that `signers[i]` produced `signatures[i]` over the raw transaction.
pub fn validate_basic(signed: &SignedTx, signers: &[Address]) -> Result<()> {
    let secp = Secp256k1::verification_only();
    let msg = tx_digest(&signed.raw)?;

    for (i, expected) in signers.iter().enumerate() {
        let sig = signed
            .signatures
            .get(i)
            .ok_or_else(|| BridgeError::MissingSignature(expected.to_string()))?;

        let pubkey = PublicKey::from_slice(&sig.signer)?;
        if &Address::from_pubkey(&pubkey) != expected {
            return Err(BridgeError::InvalidSignature(format!(
                "signature {} is not from {}",
                i, expected
            )));
        }

        let signature = ecdsa::Signature::from_compact(&sig.signed)?;
        secp.verify_ecdsa(&msg, &signature, &pubkey)?;
    }

    Ok(())
}

pub fn validate_fee(opt: &FeeOpt, fee: &Fee) -> Result<()> {
    if fee.price.currency != opt.fee_currency.name {
        return Err(BridgeError::Fee(format!(
            "fee must be paid in {}, got {}",
            opt.fee_currency.name, fee.price.currency
        )));
    }
    if fee.price.amount < opt.min_gas_price {
        return Err(BridgeError::Fee(format!(
            "gas price {} below minimum {}",
            fee.price.amount, opt.min_gas_price
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: impl ToString) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<Tag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub log: String,
    pub info: String,
    pub tags: Vec<Tag>,
    pub events: Vec<Event>,
    pub gas_used: u64,
}

impl Response {
    pub fn error(log: impl ToString) -> Self {
        Self {
            log: log.to_string(),
            ..Default::default()
        }
    }

    pub fn has_event(&self, kind: &str) -> bool {
        self.events.iter().any(|e| e.kind == kind)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.key == key).map(|t| t.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeCharge {
    pub payer: Address,
    pub coin: Coin,
    pub gas_used: u64,
}

impl FeeCharge {
    /// Moves the charged coin from the fee pool back to the payer.
    pub fn refund(&self, ctx: &Context) {
        let mut journal = BalanceJournal::new(ctx.balances.as_ref());
        let refunded = journal
            .debit(&ctx.fee_pool_address, &self.coin)
            .and_then(|_| journal.credit(&self.payer, &self.coin));
        match refunded {
            Ok(()) => log::debug!("Refunded {} to {}", self.coin, self.payer),
            Err(e) => {
                journal.rollback();
                log::error!("Failed to refund {} to {}: {}", self.coin, self.payer, e);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeOutcome {
    Charged(FeeCharge),
    NotApplicable,
    Rejected(Response),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub btc_pubkey: bitcoin::PublicKey,
}

pub trait ValidatorRegistry: Send + Sync {
    fn is_validator_address(&self, address: &Address) -> bool;
    fn get_validator_set(&self) -> Result<Vec<Validator>>;

    fn get_bitcoin_keys(&self) -> Result<Vec<bitcoin::PublicKey>> {
        Ok(self.get_validator_set()?.into_iter().map(|v| v.btc_pubkey).collect())
    }
}

pub trait Balances: Send + Sync {
    fn add_to_address(&self, address: &Address, coin: &Coin) -> Result<()>;
    fn minus_from_address(&self, address: &Address, coin: &Coin) -> Result<()>;
}

#[derive(Debug)]
enum BalanceEntry {
    Credit(Address, Coin),
    Debit(Address, Coin),
}

/// Balance writes of one delivered transaction, undone in reverse order
/// when a later write of the same transaction fails.
pub(crate) struct BalanceJournal<'a> {
    balances: &'a dyn Balances,
    entries: Vec<BalanceEntry>,
}

impl<'a> BalanceJournal<'a> {
    pub(crate) fn new(balances: &'a dyn Balances) -> Self {
        Self {
            balances,
            entries: Vec::new(),
        }
    }

    pub(crate) fn credit(&mut self, address: &Address, coin: &Coin) -> Result<()> {
        self.balances.add_to_address(address, coin)?;
        self.entries.push(BalanceEntry::Credit(address.clone(), coin.clone()));
        Ok(())
    }

    pub(crate) fn debit(&mut self, address: &Address, coin: &Coin) -> Result<()> {
        self.balances.minus_from_address(address, coin)?;
        self.entries.push(BalanceEntry::Debit(address.clone(), coin.clone()));
        Ok(())
    }

    pub(crate) fn rollback(self) {
        let Self { balances, entries } = self;
        for entry in entries.into_iter().rev() {
            let result = match &entry {
                BalanceEntry::Credit(address, coin) => balances.minus_from_address(address, coin),
                BalanceEntry::Debit(address, coin) => balances.add_to_address(address, coin),
            };
            if let Err(e) = result {
                log::error!("Failed to undo {:?}: {}", entry, e);
            }
        }
    }
}

pub trait Currencies: Send + Sync {
    fn get_currency_by_name(&self, name: &str) -> Option<Currency>;
}

/// State handed to every handler.
#[derive(Clone)]
pub struct Context {
    pub trackers: TrackerStore,
    pub validators: Arc<dyn ValidatorRegistry>,
    pub balances: Arc<dyn Balances>,
    pub currencies: Arc<dyn Currencies>,
    pub lock_scripts: Arc<dyn LockScriptStore>,
    /// Present only on the deliver path of a validator node.
    pub job_store: Option<JobStore>,
    pub fee_opt: FeeOpt,
    pub total_supply_address: Address,
    pub fee_pool_address: Address,
    pub chain_driver: ChainDriver,
}

impl Context {
    pub fn new(
        config: &BridgeConfig,
        trackers: TrackerStore,
        validators: Arc<dyn ValidatorRegistry>,
        balances: Arc<dyn Balances>,
        currencies: Arc<dyn Currencies>,
        lock_scripts: Arc<dyn LockScriptStore>,
    ) -> Self {
        Self {
            trackers,
            validators,
            balances,
            currencies,
            lock_scripts,
            job_store: None,
            fee_opt: FeeOpt {
                fee_currency: config.fees.fee_currency.clone(),
                min_gas_price: config.fees.min_gas_price,
            },
            total_supply_address: config.total_supply_address.clone(),
            fee_pool_address: config.fee_pool_address.clone(),
            chain_driver: ChainDriver::from_config(&config.fees),
        }
    }

    pub fn with_job_store(mut self, job_store: JobStore) -> Self {
        self.job_store = Some(job_store);
        self
    }

    pub fn require_validator(&self, address: &Address) -> Result<()> {
        if self.validators.is_validator_address(address) {
            Ok(())
        } else {
            Err(BridgeError::NotValidator(address.to_string()))
        }
    }

    fn btc_coin(&self, amount: u64) -> Result<Coin> {
        let currency = self
            .currencies
            .get_currency_by_name(BTC_CURRENCY)
            .ok_or_else(|| BridgeError::CurrencyNotFound(BTC_CURRENCY.to_string()))?;
        Ok(currency.coin_from_unit(amount))
    }
}

pub trait Tx: Send + Sync {
    fn validate(&self, ctx: &Context, signed: &SignedTx) -> Result<bool>;
    fn process_check(&self, ctx: &Context, tx: &RawTx) -> (bool, Response);
    fn process_deliver(&self, ctx: &Context, tx: &RawTx) -> (bool, Response);
    fn process_fee(&self, ctx: &Context, signed: &SignedTx, gas_start: u64, size: u64) -> FeeOutcome;
}

/// Charges `price * (gas_start + size * multiplier)` from the first signer to the fee pool.
pub fn basic_fee_handling(
    ctx: &Context,
    signed: &SignedTx,
    gas_start: u64,
    size: u64,
    multiplier: u64,
) -> FeeOutcome {
    let charge = || -> Result<FeeCharge> {
        let price = &signed.raw.fee.price;
        if price.currency != ctx.fee_opt.fee_currency.name {
            return Err(BridgeError::Fee(format!("unknown fee currency {}", price.currency)));
        }

        let gas_used = size
            .checked_mul(multiplier)
            .and_then(|g| g.checked_add(gas_start))
            .ok_or_else(|| BridgeError::Fee("gas overflow".to_string()))?;
        let amount = price
            .amount
            .checked_mul(gas_used)
            .ok_or_else(|| BridgeError::Fee("fee overflow".to_string()))?;

        let payer = signed.first_signer()?;
        let coin = Coin {
            currency: price.currency.clone(),
            amount,
        };
        let mut journal = BalanceJournal::new(ctx.balances.as_ref());
        journal.debit(&payer, &coin)?;
        if let Err(e) = journal.credit(&ctx.fee_pool_address, &coin) {
            journal.rollback();
            return Err(e);
        }

        log::debug!("Charged {} from {} for {}", coin, payer, signed.raw.tx_type);
        Ok(FeeCharge { payer, coin, gas_used })
    };

    match charge() {
        Ok(charge) => FeeOutcome::Charged(charge),
        Err(e) => FeeOutcome::Rejected(Response::error(e)),
    }
}

/// Carries out the effects of a tracker transition, then persists the tracker.
/// Balance writes are journaled: if any ledger write or the tracker write
/// fails, earlier balance writes are undone and the stored tracker is
/// untouched. A job that fails to save is logged and left to
/// `JobRunner::reschedule_pending`.
/// On the check path nothing is written and only the events are returned.
pub(crate) fn commit(
    ctx: &Context,
    tracker: &Tracker,
    effects: Vec<Effect>,
    tags: &[Tag],
    deliver: bool,
) -> Result<Vec<Event>> {
    if !deliver {
        return Ok(effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::Emit(kind) => Some(Event {
                    kind: kind.to_string(),
                    attributes: tags.to_vec(),
                }),
                _ => None,
            })
            .collect());
    }

    let mut journal = BalanceJournal::new(ctx.balances.as_ref());
    if let Err(e) = apply_effects(ctx, tracker, &effects, &mut journal) {
        journal.rollback();
        return Err(e);
    }

    let mut events = Vec::new();
    for effect in effects {
        match effect {
            Effect::ScheduleJob(kind) => {
                if let Some(job_store) = &ctx.job_store {
                    if let Err(e) = job_store.save_job(&Job::new(kind, &tracker.name)) {
                        log::error!("Failed to schedule {:?} for {}: {}", kind, tracker.name, e);
                    }
                }
            }
            Effect::Emit(kind) => events.push(Event {
                kind: kind.to_string(),
                attributes: tags.to_vec(),
            }),
            _ => {}
        }
    }

    Ok(events)
}

fn apply_effects(
    ctx: &Context,
    tracker: &Tracker,
    effects: &[Effect],
    journal: &mut BalanceJournal<'_>,
) -> Result<()> {
    for effect in effects {
        match effect {
            Effect::Mint { to, amount } => {
                let coin = ctx.btc_coin(*amount)?;
                journal.credit(to, &coin)?;
                journal.credit(&ctx.total_supply_address, &coin)?;
                log::info!("Minted {} to {} via {}", coin, to, tracker.name);
            }
            Effect::Burn { from, amount } => {
                let coin = ctx.btc_coin(*amount)?;
                journal.debit(from, &coin)?;
                journal.debit(&ctx.total_supply_address, &coin)?;
                log::info!("Burned {} from {} via {}", coin, from, tracker.name);
            }
            _ => {}
        }
    }

    for effect in effects {
        if let Effect::SaveLockScript { address, script } = effect {
            ctx.lock_scripts.save_lock_script(address, script)?;
        }
    }

    ctx.trackers.set_tracker(tracker)
}

/// Maps a handler result onto the pipeline's `(ok, response)` convention.
pub(crate) fn respond(tx_type: TxType, result: Result<Response>) -> (bool, Response) {
    match result {
        Ok(response) => (true, response),
        Err(e) => {
            log::warn!("{} rejected: {}", tx_type, e);
            (false, Response::error(e))
        }
    }
}

pub struct Router {
    handlers: HashMap<TxType, Box<dyn Tx>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn with_bridge_handlers() -> Self {
        let mut router = Self::new();
        router.handlers.insert(TxType::Lock, Box::new(lock::BtcLockTx));
        router.handlers.insert(TxType::Redeem, Box::new(redeem::BtcRedeemTx));
        router.handlers.insert(TxType::AddSignature, Box::new(add_signature::BtcAddSignatureTx));
        router.handlers.insert(TxType::BroadcastSuccess, Box::new(broadcast_success::BtcBroadcastSuccessTx));
        router.handlers.insert(
            TxType::FailedBroadcastReset,
            Box::new(failed_broadcast_reset::BtcFailedBroadcastResetTx),
        );
        router.handlers.insert(
            TxType::ReportFinalityMint,
            Box::new(report_finality_mint::BtcReportFinalityMintTx),
        );
        router
    }

    pub fn handler(&self, tx_type: TxType) -> Result<&dyn Tx> {
        self.handlers
            .get(&tx_type)
            .map(|h| h.as_ref())
            .ok_or_else(|| BridgeError::WrongTxType(format!("no handler for {}", tx_type)))
    }

    fn run(&self, ctx: &Context, signed: &SignedTx, deliver: bool) -> (bool, Response) {
        let handler = match self.handler(signed.raw.tx_type) {
            Ok(handler) => handler,
            Err(e) => return (false, Response::error(e)),
        };

        match handler.validate(ctx, signed) {
            Ok(true) => {}
            Ok(false) => return (false, Response::error("validation failed")),
            Err(e) => {
                log::warn!("{} failed validation: {}", signed.raw.tx_type, e);
                return (false, Response::error(e));
            }
        }

        let (ok, response) = handler.process_check(ctx, &signed.raw);
        if !ok || !deliver {
            return (ok, response);
        }

        let size = match signed.size() {
            Ok(size) => size,
            Err(e) => return (false, Response::error(e)),
        };
        let charge = match handler.process_fee(ctx, signed, 0, size) {
            FeeOutcome::Charged(charge) => Some(charge),
            FeeOutcome::NotApplicable => None,
            FeeOutcome::Rejected(response) => {
                log::warn!("{} rejected: {}", signed.raw.tx_type, response.log);
                return (false, response);
            }
        };

        let (ok, mut response) = handler.process_deliver(ctx, &signed.raw);
        match charge {
            Some(charge) if ok => response.gas_used = charge.gas_used,
            Some(charge) => charge.refund(ctx),
            None => {}
        }
        (ok, response)
    }

    pub fn check_tx(&self, ctx: &Context, signed: &SignedTx) -> (bool, Response) {
        self.run(ctx, signed, false)
    }

    pub fn deliver_tx(&self, ctx: &Context, signed: &SignedTx) -> (bool, Response) {
        self.run(ctx, signed, true)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::with_bridge_handlers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ledger_address, ledger_keys, user_key, FakeBalances, TestBridge};

    fn raw() -> RawTx {
        RawTx::new(
            TxType::Lock,
            &serde_json::json!({"hello": "world"}),
            Fee {
                price: Coin {
                    currency: "OLT".to_string(),
                    amount: 2,
                },
                gas: 100,
            },
            "memo",
        )
        .unwrap()
    }

    #[test]
    fn test_tx_type_codes() {
        for t in TxType::ALL {
            assert_eq!(TxType::from_code(t.code()), Some(t));
        }
        assert_eq!(TxType::from_code(0x01), None);
        assert_eq!(TxType::FailedBroadcastReset.to_string(), "BTC_FAILED_BROADCAST_RESET");
    }

    #[test]
    fn test_validate_basic() {
        let keys = ledger_keys(2);
        let secp = Secp256k1::new();
        let addr0 = Address::from_pubkey(&PublicKey::from_secret_key(&secp, &keys[0]));
        let addr1 = Address::from_pubkey(&PublicKey::from_secret_key(&secp, &keys[1]));

        let signed = SignedTx::sign(raw(), &keys[..1]).unwrap();
        assert!(validate_basic(&signed, &[addr0.clone()]).is_ok());
        assert_eq!(signed.first_signer().unwrap(), addr0);
        assert!(matches!(
            validate_basic(&signed, &[addr1.clone()]),
            Err(BridgeError::InvalidSignature(_))
        ));
        assert!(matches!(
            validate_basic(&signed, &[addr0.clone(), addr1]),
            Err(BridgeError::MissingSignature(_))
        ));

        let mut tampered = signed.clone();
        tampered.raw.memo = "other".to_string();
        assert!(validate_basic(&tampered, &[addr0]).is_err());
    }

    #[test]
    fn test_decode_checks_type() {
        let tx = raw();
        let value: serde_json::Value = tx.decode(TxType::Lock).unwrap();
        assert_eq!(value["hello"], "world");
        assert!(matches!(
            tx.decode::<serde_json::Value>(TxType::Redeem),
            Err(BridgeError::WrongTxType(_))
        ));
    }

    #[test]
    fn test_validate_fee() {
        let opt = FeeOpt {
            fee_currency: Currency::new("OLT", 18),
            min_gas_price: 1,
        };
        assert!(validate_fee(&opt, &raw().fee).is_ok());

        let mut fee = raw().fee;
        fee.price.amount = 0;
        assert!(validate_fee(&opt, &fee).is_err());
        fee.price = Coin { currency: "BTC".to_string(), amount: 5 };
        assert!(validate_fee(&opt, &fee).is_err());
    }

    #[test]
    fn test_balance_journal_rollback() {
        let balances = FakeBalances::default();
        let alice = Address::new(b"alice".to_vec());
        let bob = Address::new(b"bob".to_vec());
        let btc = |amount| Coin { currency: "BTC".to_string(), amount };
        balances.add_to_address(&alice, &btc(10)).unwrap();

        let mut journal = BalanceJournal::new(&balances);
        journal.debit(&alice, &btc(4)).unwrap();
        journal.credit(&bob, &btc(4)).unwrap();
        assert!(journal.debit(&bob, &btc(5)).is_err());
        journal.rollback();

        assert_eq!(balances.balance_of(&alice, "BTC"), 10);
        assert_eq!(balances.balance_of(&bob, "BTC"), 0);
    }

    #[test]
    fn test_fee_charge_and_refund() {
        let bridge = TestBridge::new();
        let user = user_key();
        let payer = ledger_address(&user);
        let pool = bridge.ctx.fee_pool_address.clone();
        let raw = RawTx::new(TxType::Lock, &serde_json::json!({}), bridge.user_fee(), "fee").unwrap();
        let signed = SignedTx::sign(raw, &[user]).unwrap();

        assert!(matches!(
            basic_fee_handling(&bridge.ctx, &signed, 0, 10, 1),
            FeeOutcome::Rejected(_)
        ));
        assert_eq!(bridge.balances.balance_of(&pool, "OLT"), 0);

        bridge.fund_fees(&payer);
        let funded = bridge.balances.balance_of(&payer, "OLT");
        let charge = match basic_fee_handling(&bridge.ctx, &signed, 5, 10, 2) {
            FeeOutcome::Charged(charge) => charge,
            other => panic!("expected a charge, got {:?}", other),
        };
        assert_eq!(charge.payer, payer);
        assert_eq!(charge.gas_used, 25);
        assert_eq!(charge.coin.amount, 25 * bridge.config.fees.min_gas_price);
        assert_eq!(bridge.balances.balance_of(&payer, "OLT"), funded - charge.coin.amount);
        assert_eq!(bridge.balances.balance_of(&pool, "OLT"), charge.coin.amount);

        charge.refund(&bridge.ctx);
        assert_eq!(bridge.balances.balance_of(&payer, "OLT"), funded);
        assert_eq!(bridge.balances.balance_of(&pool, "OLT"), 0);
    }
}
