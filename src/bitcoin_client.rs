use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use serde::{Deserialize, Serialize};

use crate::config::{BitcoinRpcConfig, ExplorerConfig};
use crate::{BridgeError, Result};

/// Submission path to a Bitcoin node.
pub trait BitcoinRpc: Send + Sync {
    fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid>;
}

/// Source of confirmation depth and output data for Bitcoin transactions.
#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    async fn get_tx(&self, txid: &Txid) -> Result<ExplorerTx>;

    async fn confirmations(&self, txid: &Txid) -> Result<u64> {
        Ok(self.get_tx(txid).await?.confirmations)
    }
}

/// Transaction as reported by the block explorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerTx {
    pub hash: String,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub outputs: Vec<ExplorerOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerOutput {
    pub value: u64,
    /// Hex encoded scriptPubKey.
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub spent_by: Option<String>,
}

impl ExplorerTx {
    pub fn output(&self, vout: u32) -> Result<&ExplorerOutput> {
        self.outputs.get(vout as usize).ok_or_else(|| {
            BridgeError::ExplorerError(format!("{} has no output {}", self.hash, vout))
        })
    }
}

/// Bitcoin Core RPC client
pub struct BitcoinClient {
    client: Client,
}

impl BitcoinClient {
    pub fn new(rpc_url: &str, auth: Auth) -> Result<Self> {
        let client = Client::new(rpc_url, auth)?;
        Ok(Self { client })
    }

    pub fn from_config(config: &BitcoinRpcConfig) -> Result<Self> {
        let auth = Auth::UserPass(config.rpc_username.clone(), config.rpc_password.clone());
        Self::new(&config.rpc_url, auth)
    }
}

impl BitcoinRpc for BitcoinClient {
    fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid> {
        let txid = self.client.send_raw_transaction(tx)?;
        log::info!("Broadcasted transaction: {}", txid);
        Ok(txid)
    }
}

/// BlockCypher REST client
#[derive(Debug, Clone)]
pub struct BlockCypherExplorer {
    base_url: String,
    token: String,
    chain_type: String,
    client: reqwest::Client,
}

impl BlockCypherExplorer {
    pub fn new(config: &ExplorerConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            chain_type: config.chain_type.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn tx_url(&self, txid: &Txid) -> String {
        format!("{}/{}/txs/{}?token={}", self.base_url, self.chain_type, txid, self.token)
    }
}

#[async_trait]
impl ConfirmationSource for BlockCypherExplorer {
    async fn get_tx(&self, txid: &Txid) -> Result<ExplorerTx> {
        let response = self.client
            .get(self.tx_url(txid))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BridgeError::ExplorerError(format!(
                "{} returned {}",
                txid,
                response.status()
            )));
        }

        let tx: ExplorerTx = response.json().await?;
        log::debug!("Explorer reports {} with {} confirmations", txid, tx.confirmations);
        Ok(tx)
    }
}
