pub mod action;
pub mod bitcoin_client;
pub mod chain_driver;
pub mod config;
pub mod error;
pub mod jobs;
pub mod multisig;
pub mod service;
pub mod store;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use bitcoin::PublicKey;

pub use action::{Balances, Context, Currencies, Router, ValidatorRegistry};
pub use bitcoin_client::{BitcoinClient, BlockCypherExplorer, ConfirmationSource};
pub use chain_driver::ChainDriver;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use jobs::{JobContext, JobRunner, JobStore};
pub use multisig::BtcMultisig;
pub use service::BridgeService;
pub use store::{BridgeDatabase, LockScriptStore, SledLockScriptStore, TrackerStore};
pub use tracker::{Tracker, TrackerState};
pub use types::{Address, Utxo};

/// One node's view of the bridge: its database and the stores on top of it.
#[derive(Debug, Clone)]
pub struct BitcoinBridge {
    pub config: BridgeConfig,
    pub database: BridgeDatabase,
    pub trackers: TrackerStore,
    pub lock_scripts: Arc<SledLockScriptStore>,
    pub jobs: JobStore,
}

impl BitcoinBridge {
    pub fn open(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let database = BridgeDatabase::open(&config.database_path)?;
        Self::with_database(config, database)
    }

    pub fn with_database(config: BridgeConfig, database: BridgeDatabase) -> Result<Self> {
        Ok(Self {
            trackers: database.trackers()?,
            lock_scripts: Arc::new(database.lock_scripts()?),
            jobs: JobStore::new(&database)?,
            database,
            config,
        })
    }

    pub fn chain_driver(&self) -> ChainDriver {
        ChainDriver::from_config(&self.config.fees)
    }

    /// Creates the genesis trackers over the validators' Bitcoin keys.
    pub fn genesis(&self, count: usize, validator_keys: &[PublicKey]) -> Result<Vec<Tracker>> {
        self.trackers
            .init_trackers(count, validator_keys, self.lock_scripts.as_ref())
    }

    pub fn service(&self, explorer: Arc<dyn ConfirmationSource>) -> BridgeService {
        BridgeService::new(self.trackers.clone(), self.lock_scripts.clone(), self.chain_driver(), explorer)
    }

    /// Handler context over the ledger's collaborators, scheduling jobs into
    /// this node's queue.
    pub fn ledger_context(
        &self,
        validators: Arc<dyn ValidatorRegistry>,
        balances: Arc<dyn Balances>,
        currencies: Arc<dyn Currencies>,
    ) -> Context {
        Context::new(
            &self.config,
            self.trackers.clone(),
            validators,
            balances,
            currencies,
            self.lock_scripts.clone(),
        )
        .with_job_store(self.jobs.clone())
    }
}
