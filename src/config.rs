use serde::{Deserialize, Serialize};
use bitcoin::Network;

use crate::types::{Address, Currency};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub network: Network,
    pub database_path: String,
    pub bitcoin: BitcoinRpcConfig,
    pub explorer: ExplorerConfig,
    pub fees: FeeConfig,
    pub jobs: JobConfig,
    // Ledger accounts touched by mint, burn and fee handling
    pub total_supply_address: Address,
    pub fee_pool_address: Address,
    // Endpoint of the local node's internal transaction submission path
    pub node_rpc_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinRpcConfig {
    pub rpc_url: String,
    pub rpc_username: String,
    pub rpc_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerConfig {
    pub base_url: String,
    pub token: String,
    /// BlockCypher chain name: `main`, `test3` or `test`.
    pub chain_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    pub btc_fee_rate: u64,       // sat/byte charged on bridge transactions
    pub min_fee_rate: u64,       // sat/byte accepted on user-built transactions
    pub max_fee_rate: u64,
    pub fee_currency: Currency,
    pub min_gas_price: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub interval_seconds: u64,
    pub max_broadcast_retries: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            database_path: "./btcbridge.db".to_string(),
            bitcoin: BitcoinRpcConfig {
                rpc_url: "http://127.0.0.1:18332".to_string(),
                rpc_username: "btcbridge".to_string(),
                rpc_password: "password".to_string(),
            },
            explorer: ExplorerConfig {
                base_url: "https://api.blockcypher.com/v1/btc".to_string(),
                token: String::new(),
                chain_type: "test3".to_string(),
            },
            fees: FeeConfig {
                btc_fee_rate: 70,
                min_fee_rate: 20,
                max_fee_rate: 70,
                fee_currency: Currency::new("OLT", 18),
                min_gas_price: 1,
            },
            jobs: JobConfig {
                interval_seconds: 10,
                max_broadcast_retries: 20,
            },
            total_supply_address: Address::new(b"btc_total_supply".to_vec()),
            fee_pool_address: Address::new(b"fee_pool".to_vec()),
            node_rpc_url: "http://127.0.0.1:26602/internal/broadcast".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn testnet() -> Self {
        Self::default()
    }

    pub fn mainnet() -> Self {
        let mut config = Self::default();
        config.network = Network::Bitcoin;
        config.database_path = "./btcbridge-mainnet.db".to_string();
        config.bitcoin.rpc_url = "http://127.0.0.1:8332".to_string();
        config.explorer.chain_type = "main".to_string();
        config
    }

    pub fn regtest() -> Self {
        let mut config = Self::default();
        config.network = Network::Regtest;
        config.database_path = "./btcbridge-regtest.db".to_string();
        config.bitcoin.rpc_url = "http://127.0.0.1:18443".to_string();
        config.jobs.interval_seconds = 2;
        config
    }

    /// Maps a chain name as given on the command line to a preset.
    pub fn for_chain(chain: &str) -> Self {
        match chain {
            "mainnet" => Self::mainnet(),
            "regtest" => Self::regtest(),
            _ => Self::testnet(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.fees.btc_fee_rate == 0 {
            return Err(crate::BridgeError::InvalidConfig(
                "btc_fee_rate must be > 0".to_string()
            ));
        }

        if self.fees.min_fee_rate > self.fees.max_fee_rate {
            return Err(crate::BridgeError::InvalidConfig(
                "min_fee_rate cannot exceed max_fee_rate".to_string()
            ));
        }

        if self.jobs.interval_seconds == 0 {
            return Err(crate::BridgeError::InvalidConfig(
                "job interval must be > 0".to_string()
            ));
        }

        if self.total_supply_address == self.fee_pool_address {
            return Err(crate::BridgeError::InvalidConfig(
                "total supply and fee pool addresses must differ".to_string()
            ));
        }

        Ok(())
    }
}
