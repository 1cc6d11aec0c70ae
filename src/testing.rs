//! In-crate fakes for the bridge's external collaborators and a small
//! multi-validator fixture. Compiled only for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::consensus::deserialize;
use bitcoin::{Network, PrivateKey, PublicKey, Transaction, Txid};
use secp256k1::SecretKey;
use serde::Serialize;

use crate::action::lock::Lock;
use crate::action::{
    Balances, Context, Currencies, Fee, RawTx, Response, Router, SignedTx, TxType, Validator, ValidatorRegistry,
};
use crate::bitcoin_client::{BitcoinRpc, ConfirmationSource, ExplorerOutput, ExplorerTx};
use crate::chain_driver::ChainDriver;
use crate::config::BridgeConfig;
use crate::jobs::{JobContext, JobStore, TxSubmitter};
use crate::store::{BridgeDatabase, SledLockScriptStore, TrackerStore};
use crate::types::{Address, Coin, Currency, Utxo};
use crate::{BridgeError, Result};

pub fn btc_keys(n: usize) -> Vec<PrivateKey> {
    (0..n)
        .map(|i| {
            let secret = SecretKey::from_slice(&[i as u8 + 1; 32]).expect("valid test key");
            PrivateKey::new(secret, Network::Regtest)
        })
        .collect()
}

pub fn btc_pubkeys(n: usize) -> Vec<PublicKey> {
    let secp = Secp256k1::new();
    btc_keys(n).iter().map(|k| k.public_key(&secp)).collect()
}

/// Ledger signing keys, distinct from the Bitcoin keys.
pub fn ledger_keys(n: usize) -> Vec<SecretKey> {
    (0..n)
        .map(|i| SecretKey::from_slice(&[i as u8 + 0x41; 32]).expect("valid test key"))
        .collect()
}

pub fn user_key() -> SecretKey {
    SecretKey::from_slice(&[0x77; 32]).expect("valid test key")
}

pub fn ledger_address(key: &SecretKey) -> Address {
    Address::from_pubkey(&secp256k1::PublicKey::from_secret_key(&Secp256k1::new(), key))
}

pub struct FakeValidators {
    pub validators: Vec<Validator>,
}

impl ValidatorRegistry for FakeValidators {
    fn is_validator_address(&self, address: &Address) -> bool {
        self.validators.iter().any(|v| &v.address == address)
    }

    fn get_validator_set(&self) -> Result<Vec<Validator>> {
        Ok(self.validators.clone())
    }
}

#[derive(Default)]
pub struct FakeBalances {
    balances: Mutex<HashMap<(Address, String), u64>>,
}

impl FakeBalances {
    pub fn balance_of(&self, address: &Address, currency: &str) -> u64 {
        let balances = self.balances.lock().unwrap();
        balances
            .get(&(address.clone(), currency.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl Balances for FakeBalances {
    fn add_to_address(&self, address: &Address, coin: &Coin) -> Result<()> {
        let mut balances = self.balances.lock().unwrap();
        *balances.entry((address.clone(), coin.currency.clone())).or_insert(0) += coin.amount;
        Ok(())
    }

    fn minus_from_address(&self, address: &Address, coin: &Coin) -> Result<()> {
        let mut balances = self.balances.lock().unwrap();
        let balance = balances.entry((address.clone(), coin.currency.clone())).or_insert(0);
        if *balance < coin.amount {
            return Err(BridgeError::InsufficientFunds {
                required: coin.amount,
                available: *balance,
            });
        }
        *balance -= coin.amount;
        Ok(())
    }
}

pub struct FakeCurrencies;

impl Currencies for FakeCurrencies {
    fn get_currency_by_name(&self, name: &str) -> Option<Currency> {
        match name {
            "BTC" => Some(Currency::new("BTC", 8)),
            "OLT" => Some(Currency::new("OLT", 18)),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct FakeBitcoinRpc {
    sent: Mutex<Vec<Transaction>>,
    failing: AtomicBool,
}

impl FakeBitcoinRpc {
    pub fn sent(&self) -> Vec<Transaction> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl BitcoinRpc for FakeBitcoinRpc {
    fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::BitcoinRpcError("node unreachable".to_string()));
        }
        self.sent.lock().unwrap().push(tx.clone());
        Ok(tx.compute_txid())
    }
}

#[derive(Default)]
pub struct FakeExplorer {
    txs: Mutex<HashMap<Txid, ExplorerTx>>,
}

impl FakeExplorer {
    pub fn add_tx(&self, txid: Txid, confirmations: u64, outputs: Vec<ExplorerOutput>) {
        self.txs.lock().unwrap().insert(
            txid,
            ExplorerTx {
                hash: txid.to_string(),
                confirmations,
                outputs,
            },
        );
    }

    pub fn set_confirmations(&self, txid: Txid, confirmations: u64) {
        let mut txs = self.txs.lock().unwrap();
        txs.entry(txid)
            .or_insert_with(|| ExplorerTx {
                hash: txid.to_string(),
                confirmations: 0,
                outputs: Vec::new(),
            })
            .confirmations = confirmations;
    }
}

#[async_trait]
impl ConfirmationSource for FakeExplorer {
    async fn get_tx(&self, txid: &Txid) -> Result<ExplorerTx> {
        self.txs
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| BridgeError::ExplorerError(format!("unknown tx {}", txid)))
    }
}

#[derive(Default)]
pub struct RecordingSubmitter {
    submitted: Mutex<Vec<RawTx>>,
    failing: AtomicBool,
}

impl RecordingSubmitter {
    pub fn submitted(&self) -> Vec<RawTx> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn drain(&self) -> Vec<RawTx> {
        std::mem::take(&mut *self.submitted.lock().unwrap())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TxSubmitter for RecordingSubmitter {
    async fn submit(&self, tx: RawTx) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::SubmitError("node unreachable".to_string()));
        }
        self.submitted.lock().unwrap().push(tx);
        Ok(())
    }
}

/// Four validators over one temporary database, shared by every validator
/// the way a replicated ledger state would be after consensus.
pub struct TestBridge {
    pub config: BridgeConfig,
    pub db: BridgeDatabase,
    pub ctx: Context,
    pub router: Router,
    pub jobs: JobStore,
    pub balances: Arc<FakeBalances>,
    pub lock_scripts: Arc<SledLockScriptStore>,
    pub validator_keys: Vec<SecretKey>,
    pub btc_keys: Vec<PrivateKey>,
    pub rpc: Arc<FakeBitcoinRpc>,
    pub explorer: Arc<FakeExplorer>,
    pub submitters: Vec<Arc<RecordingSubmitter>>,
}

impl TestBridge {
    pub const VALIDATORS: usize = 4;

    pub fn new() -> Self {
        let config = BridgeConfig::regtest();
        let db = BridgeDatabase::temporary().unwrap();
        let trackers = db.trackers().unwrap();
        let lock_scripts = Arc::new(db.lock_scripts().unwrap());
        let jobs = JobStore::new(&db).unwrap();
        let balances = Arc::new(FakeBalances::default());

        let validator_keys = ledger_keys(Self::VALIDATORS);
        let btc_keys = btc_keys(Self::VALIDATORS);
        let secp = Secp256k1::new();
        let validators = validator_keys
            .iter()
            .zip(&btc_keys)
            .map(|(key, btc)| Validator {
                address: ledger_address(key),
                btc_pubkey: btc.public_key(&secp),
            })
            .collect();

        let ctx = Context::new(
            &config,
            trackers,
            Arc::new(FakeValidators { validators }),
            balances.clone(),
            Arc::new(FakeCurrencies),
            lock_scripts.clone(),
        )
        .with_job_store(jobs.clone());

        Self {
            config,
            db,
            ctx,
            router: Router::with_bridge_handlers(),
            jobs,
            balances,
            lock_scripts,
            validator_keys,
            btc_keys,
            rpc: Arc::new(FakeBitcoinRpc::default()),
            explorer: Arc::new(FakeExplorer::default()),
            submitters: (0..Self::VALIDATORS).map(|_| Arc::new(RecordingSubmitter::default())).collect(),
        }
    }

    /// Runs genesis for `count` trackers.
    pub fn with_trackers(self, count: usize) -> Self {
        self.trackers()
            .init_trackers(count, &btc_pubkeys(Self::VALIDATORS), self.lock_scripts.as_ref())
            .unwrap();
        self
    }

    pub fn trackers(&self) -> &TrackerStore {
        &self.ctx.trackers
    }

    pub fn validator_address(&self, i: usize) -> Address {
        ledger_address(&self.validator_keys[i])
    }

    pub fn chain_driver(&self) -> ChainDriver {
        ChainDriver::from_config(&self.config.fees)
    }

    pub fn user_fee(&self) -> Fee {
        Fee {
            price: Coin {
                currency: self.config.fees.fee_currency.name.clone(),
                amount: self.config.fees.min_gas_price,
            },
            gas: 100_000,
        }
    }

    /// Gives `address` enough of the fee currency to pay for a few transactions.
    pub fn fund_fees(&self, address: &Address) {
        let coin = self.config.fees.fee_currency.coin_from_unit(1_000_000);
        self.balances.add_to_address(address, &coin).unwrap();
    }

    pub fn deliver_raw(&self, raw: RawTx, key: &SecretKey) -> (bool, Response) {
        let signed = SignedTx::sign(raw, std::slice::from_ref(key)).unwrap();
        self.router.deliver_tx(&self.ctx, &signed)
    }

    pub fn check_raw(&self, raw: RawTx, key: &SecretKey) -> (bool, Response) {
        let signed = SignedTx::sign(raw, std::slice::from_ref(key)).unwrap();
        self.router.check_tx(&self.ctx, &signed)
    }

    /// Delivers a validator transaction signed by validator `i`.
    pub fn deliver_as<T: Serialize>(&self, i: usize, tx_type: TxType, msg: &T) -> (bool, Response) {
        let raw = RawTx::new(tx_type, msg, Fee::none(), "test").unwrap();
        self.deliver_raw(raw, &self.validator_keys[i])
    }

    pub fn job_context(&self, i: usize) -> JobContext {
        JobContext {
            validator_address: self.validator_address(i),
            btc_key: self.btc_keys[i],
            trackers: self.ctx.trackers.clone(),
            lock_scripts: self.lock_scripts.clone(),
            chain_driver: self.chain_driver(),
            bitcoin: self.rpc.clone(),
            explorer: self.explorer.clone(),
            submitter: self.submitters[i].clone(),
            max_broadcast_retries: self.config.jobs.max_broadcast_retries,
        }
    }

    /// Delivers whatever validator `i`'s jobs submitted, in order.
    pub fn relay(&self, i: usize) -> Vec<(bool, Response)> {
        self.submitters[i]
            .drain()
            .into_iter()
            .map(|raw| self.deliver_raw(raw, &self.validator_keys[i]))
            .collect()
    }

    /// Delivers a Lock of `funding` into `tracker_name` from [`user_key`].
    /// Returns the lock amount.
    pub fn lock(&self, tracker_name: &str, funding: Utxo) -> u64 {
        let tracker = self.trackers().get(tracker_name).unwrap();
        let bytes = self
            .chain_driver()
            .prepare_lock(tracker.current_utxo().as_ref(), &funding, &tracker.process_lock_script_address)
            .unwrap();
        let tx: Transaction = deserialize(&bytes).unwrap();
        let lock_amount = tx.output[0].value.to_sat() - tracker.current_balance;

        let user = user_key();
        let locker = ledger_address(&user);
        self.fund_fees(&locker);

        let lock = Lock {
            locker,
            tracker_name: tracker_name.to_string(),
            btc_txn: bytes,
            lock_amount,
        };
        let raw = RawTx::new(TxType::Lock, &lock, self.user_fee(), "lock").unwrap();
        let (ok, response) = self.deliver_raw(raw, &user);
        assert!(ok, "lock rejected: {}", response.log);
        lock_amount
    }
}
