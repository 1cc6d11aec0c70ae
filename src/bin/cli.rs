use clap::{Parser, Subcommand};
use bitcoin::{PublicKey, Txid};
use btcbridge::action::{Fee, RawTx};
use btcbridge::chain_driver::create_multisig_address;
use btcbridge::multisig::threshold_for;
use btcbridge::service::{LockRequest, RedeemRequest};
use btcbridge::types::Coin;
use btcbridge::{Address, BitcoinBridge, BlockCypherExplorer, BridgeConfig, BridgeError, Result};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bridge-cli")]
#[command(about = "Operator and user tooling for the Bitcoin bridge")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "testnet")]
    network: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the genesis trackers
    Genesis {
        /// Number of trackers to create
        #[arg(long, default_value = "6")]
        count: usize,

        /// Validators' compressed Bitcoin public keys, hex encoded
        #[arg(long, value_delimiter = ',', required = true)]
        validator_keys: Vec<String>,
    },
    /// List all trackers
    Trackers,
    /// Show tracker details
    Tracker {
        /// Tracker name
        name: String,
    },
    /// Derive a multisig lock script and its P2SH address
    MultisigAddress {
        /// Compressed public keys, hex encoded
        #[arg(long, value_delimiter = ',', required = true)]
        keys: Vec<String>,

        /// Required signatures, defaults to the bridge quorum
        #[arg(long)]
        threshold: Option<usize>,

        /// Randomness pushed into the script, hex encoded
        #[arg(long, default_value = "00000000")]
        randomness: String,
    },
    /// Build an unsigned lock of a confirmed output
    PrepareLock {
        /// Funding transaction id
        txid: String,

        /// Output index
        #[arg(long, default_value = "0")]
        vout: u32,
    },
    /// Build an unsigned redeem to a Bitcoin address
    PrepareRedeem {
        /// Bitcoin address receiving the redeemed coins
        address: String,

        /// Amount in satoshi
        #[arg(long)]
        amount: u64,
    },
    /// Attach the user's signature to a prepared lock and emit the ledger transaction
    ProcessLock {
        /// Locker's ledger address, hex encoded
        #[arg(long)]
        address: String,

        #[arg(long)]
        tracker: String,

        /// Prepared lock transaction, hex encoded
        #[arg(long)]
        txn: String,

        /// Unlocking script for the funding input, hex encoded
        #[arg(long)]
        signature: String,

        #[arg(long, default_value = "100000")]
        gas: u64,
    },
    /// Check a prepared redeem and emit the ledger transaction
    ProcessRedeem {
        /// Redeemer's ledger address, hex encoded
        #[arg(long)]
        address: String,

        #[arg(long)]
        tracker: String,

        /// Prepared redeem transaction, hex encoded
        #[arg(long)]
        txn: String,

        /// Amount in satoshi
        #[arg(long)]
        amount: u64,

        #[arg(long, default_value = "100000")]
        gas: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config = if let Some(config_path) = cli.config {
        let config_str = std::fs::read_to_string(config_path)?;
        serde_json::from_str(&config_str)?
    } else {
        BridgeConfig::for_chain(&cli.network)
    };

    match cli.command {
        Commands::MultisigAddress { keys, threshold, randomness } => {
            let keys = parse_pubkeys(&keys)?;
            let m = threshold.unwrap_or_else(|| threshold_for(keys.len()));
            let (script, address, signers) = create_multisig_address(m, &keys, &hex::decode(randomness)?)?;
            let p2sh = bitcoin::Address::p2sh_from_hash(address, config.network);

            println!("🔐 {}-of-{} lock script", m, signers.len());
            println!("   Script: {}", hex::encode(script.as_bytes()));
            println!("   Script hash: {}", address);
            println!("   Address: {}", p2sh);
        }
        command => {
            let bridge = BitcoinBridge::open(config)?;
            handle_bridge_command(command, &bridge).await?;
        }
    }

    Ok(())
}

async fn handle_bridge_command(command: Commands, bridge: &BitcoinBridge) -> Result<()> {
    let explorer = Arc::new(BlockCypherExplorer::new(&bridge.config.explorer));

    match command {
        Commands::Genesis { count, validator_keys } => {
            let keys = parse_pubkeys(&validator_keys)?;
            let created = bridge.genesis(count, &keys)?;

            println!("🌱 Genesis: {} new trackers over {} validators", created.len(), keys.len());
            for tracker in &created {
                let address = bitcoin::Address::p2sh_from_hash(tracker.process_lock_script_address, bridge.config.network);
                println!("   {}: {}", tracker.name, address);
            }
        }
        Commands::Trackers => {
            let trackers = bridge.trackers.list()?;
            println!("📋 {} trackers", trackers.len());
            for tracker in trackers {
                println!(
                    "   {} | {:?} | {} sat | {:?}",
                    tracker.name, tracker.state, tracker.current_balance, tracker.process_type
                );
            }
        }
        Commands::Tracker { name } => {
            let tracker = bridge.trackers.get(&name)?;
            println!("{}", serde_json::to_string_pretty(&tracker)?);
        }
        Commands::PrepareLock { txid, vout } => {
            let txid = Txid::from_str(&txid).map_err(|e| BridgeError::TxMismatch(e.to_string()))?;
            let prepared = bridge.service(explorer).prepare_lock(txid, vout).await?;
            println!("{}", serde_json::to_string_pretty(&prepared)?);
        }
        Commands::PrepareRedeem { address, amount } => {
            let address = bitcoin::Address::from_str(&address)
                .map_err(|e| BridgeError::InvalidScript(e.to_string()))?
                .require_network(bridge.config.network)
                .map_err(|e| BridgeError::InvalidScript(e.to_string()))?;
            let prepared = bridge.service(explorer).prepare_redeem(&address.script_pubkey(), amount)?;
            println!("{}", serde_json::to_string_pretty(&prepared)?);
        }
        Commands::ProcessLock { address, tracker, txn, signature, gas } => {
            let request = LockRequest {
                address: Address::from_str(&address)?,
                tracker_name: tracker,
                txn: hex::decode(txn)?,
                signature: hex::decode(signature)?,
                fee: user_fee(&bridge.config, gas),
            };
            let raw = bridge.service(explorer).add_user_signature_and_process_lock(request).await?;
            print_raw(&raw)?;
        }
        Commands::ProcessRedeem { address, tracker, txn, amount, gas } => {
            let request = RedeemRequest {
                address: Address::from_str(&address)?,
                tracker_name: tracker,
                txn: hex::decode(txn)?,
                redeem_amount: amount,
                fee: user_fee(&bridge.config, gas),
            };
            let raw = bridge.service(explorer).add_user_signature_and_process_redeem(request).await?;
            print_raw(&raw)?;
        }
        Commands::MultisigAddress { .. } => {}
    }

    Ok(())
}

fn parse_pubkeys(keys: &[String]) -> Result<Vec<PublicKey>> {
    keys.iter()
        .map(|k| PublicKey::from_str(k).map_err(|e| BridgeError::KeyParseError(format!("{}: {}", k, e))))
        .collect()
}

fn user_fee(config: &BridgeConfig, gas: u64) -> Fee {
    Fee {
        price: Coin {
            currency: config.fees.fee_currency.name.clone(),
            amount: config.fees.min_gas_price,
        },
        gas,
    }
}

fn print_raw(raw: &RawTx) -> Result<()> {
    println!("✍️  {} ready to sign and submit", raw.tx_type);
    println!("{}", serde_json::to_string_pretty(raw)?);
    Ok(())
}
