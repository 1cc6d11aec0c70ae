/// Persistent tracker and lock script storage
/// Uses sled trees holding serde_json values

use std::path::Path;

use bitcoin::hashes::Hash;
use bitcoin::{PublicKey, Script, ScriptBuf, ScriptHash};
use rand::RngCore;
use sled::{Db, Tree};

use crate::chain_driver::{create_multisig_address, MULTISIG_RANDOMNESS_LEN};
use crate::multisig::threshold_for;
use crate::tracker::Tracker;
use crate::{BridgeError, Result};

pub const TRACKER_NAME_PREFIX: &str = "tracker_";

/// Validator-local store of redeem scripts keyed by their P2SH hash.
pub trait LockScriptStore: Send + Sync {
    fn save_lock_script(&self, address: &ScriptHash, script: &Script) -> Result<()>;
    fn get_lock_script(&self, address: &ScriptHash) -> Result<ScriptBuf>;
}

/// Opens the node database and hands out its stores.
#[derive(Debug, Clone)]
pub struct BridgeDatabase {
    db: Db,
}

impl BridgeDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| BridgeError::InvalidConfig(format!("Failed to open database: {}", e)))?;
        Ok(Self { db })
    }

    /// In-memory database, removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn trackers(&self) -> Result<TrackerStore> {
        TrackerStore::new(&self.db)
    }

    pub fn lock_scripts(&self) -> Result<SledLockScriptStore> {
        SledLockScriptStore::new(&self.db)
    }

    pub fn tree(&self, name: &str) -> Result<(Db, Tree)> {
        Ok((self.db.clone(), self.db.open_tree(name)?))
    }
}

#[derive(Debug, Clone)]
pub struct TrackerStore {
    db: Db,
    trackers: Tree,
}

impl TrackerStore {
    pub fn new(db: &Db) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            trackers: db.open_tree("trackers")?,
        })
    }

    pub fn get(&self, name: &str) -> Result<Tracker> {
        let value = self
            .get_raw(name)?
            .ok_or_else(|| BridgeError::TrackerNotFound(name.to_string()))?;
        Ok(serde_json::from_slice(&value)?)
    }

    /// Stored bytes of a tracker, as written by the last successful handler.
    pub fn get_raw(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.trackers.get(name)?.map(|v| v.to_vec()))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.trackers.contains_key(name)?)
    }

    pub fn set_tracker(&self, tracker: &Tracker) -> Result<()> {
        let value = serde_json::to_vec(tracker)?;
        self.trackers.insert(tracker.name.as_str(), value)?;
        self.db.flush()?;

        log::debug!("Saved tracker {} in state {:?}", tracker.name, tracker.state);
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Tracker>> {
        let mut trackers = Vec::new();
        for item in self.trackers.iter() {
            let (_, value) = item?;
            trackers.push(serde_json::from_slice(&value)?);
        }
        Ok(trackers)
    }

    /// Available tracker with the lowest settled balance.
    pub fn get_tracker_for_lock(&self) -> Result<Tracker> {
        self.list()?
            .into_iter()
            .filter(Tracker::is_available)
            .min_by_key(|t| t.current_balance)
            .ok_or(BridgeError::NoTrackerAvailable("lock"))
    }

    /// Available funded tracker with the highest settled balance, if it covers `amount`.
    pub fn get_tracker_for_redeem(&self, amount: u64) -> Result<Tracker> {
        let tracker = self
            .list()?
            .into_iter()
            .filter(|t| t.is_available() && !t.is_first_lock())
            .max_by(|a, b| {
                a.current_balance
                    .cmp(&b.current_balance)
                    .then_with(|| b.name.cmp(&a.name))
            })
            .ok_or(BridgeError::NoTrackerAvailable("redeem"))?;

        if tracker.current_balance < amount {
            return Err(BridgeError::InsufficientFunds {
                required: amount,
                available: tracker.current_balance,
            });
        }
        Ok(tracker)
    }

    /// Genesis: creates `count` trackers, each with a fresh multisig deposit
    /// address over `validator_keys`. Existing trackers are left untouched.
    pub fn init_trackers(
        &self,
        count: usize,
        validator_keys: &[PublicKey],
        lock_scripts: &dyn LockScriptStore,
    ) -> Result<Vec<Tracker>> {
        let m = threshold_for(validator_keys.len());
        let mut rng = rand::thread_rng();
        let mut created = Vec::new();

        for i in 1..=count {
            let name = format!("{}{}", TRACKER_NAME_PREFIX, i);
            if self.exists(&name)? {
                continue;
            }

            let mut randomness = [0u8; MULTISIG_RANDOMNESS_LEN];
            rng.fill_bytes(&mut randomness);

            let (script, address, _) = create_multisig_address(m, validator_keys, &randomness)?;
            lock_scripts.save_lock_script(&address, &script)?;

            let tracker = Tracker::new(&name, address);
            self.set_tracker(&tracker)?;
            created.push(tracker);
        }

        log::info!("Initialized {} trackers with {}-of-{} multisig", created.len(), m, validator_keys.len());
        Ok(created)
    }
}

#[derive(Debug, Clone)]
pub struct SledLockScriptStore {
    db: Db,
    scripts: Tree,
}

impl SledLockScriptStore {
    pub fn new(db: &Db) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            scripts: db.open_tree("lock_scripts")?,
        })
    }
}

impl LockScriptStore for SledLockScriptStore {
    fn save_lock_script(&self, address: &ScriptHash, script: &Script) -> Result<()> {
        self.scripts.insert(address.as_byte_array(), script.as_bytes())?;
        self.db.flush()?;
        log::debug!("Saved lock script for {}", address);
        Ok(())
    }

    fn get_lock_script(&self, address: &ScriptHash) -> Result<ScriptBuf> {
        let value = self
            .scripts
            .get(address.as_byte_array())?
            .ok_or_else(|| BridgeError::LockScriptNotFound(address.to_string()))?;
        Ok(ScriptBuf::from(value.to_vec()))
    }
}
