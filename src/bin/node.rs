use clap::Parser;
use bitcoin::PrivateKey;
use btcbridge::jobs::HttpSubmitter;
use btcbridge::{
    Address, BitcoinBridge, BitcoinClient, BlockCypherExplorer, BridgeConfig, BridgeError, JobContext, JobRunner,
    Result,
};
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Parser)]
#[command(name = "bridge-node")]
#[command(about = "Bitcoin bridge validator node - signs, broadcasts and finalizes vault transactions")]
#[command(version = "0.1.0")]
struct Cli {
    #[arg(long, default_value = "testnet")]
    network: String,

    #[arg(long)]
    config: Option<String>,

    /// This validator's Bitcoin signing key (WIF)
    #[arg(long)]
    btc_key: String,

    /// This validator's ledger address, hex encoded
    #[arg(long)]
    validator_address: String,

    /// Seconds between job passes, overrides the config
    #[arg(long)]
    interval: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config: BridgeConfig = if let Some(config_path) = cli.config {
        let config_str = std::fs::read_to_string(config_path)?;
        serde_json::from_str(&config_str)?
    } else {
        BridgeConfig::for_chain(&cli.network)
    };

    let btc_key = PrivateKey::from_wif(&cli.btc_key).map_err(|e| BridgeError::KeyParseError(e.to_string()))?;
    let validator_address = Address::from_str(&cli.validator_address)?;
    let interval = Duration::from_secs(cli.interval.unwrap_or(config.jobs.interval_seconds));

    let bridge = BitcoinBridge::open(config)?;
    let config = &bridge.config;

    println!("🌉 Bitcoin Bridge Node Starting");
    println!("===============================");
    println!("Network: {:?}", config.network);
    println!("Validator: {}", validator_address);
    println!("Bitcoin RPC: {}", config.bitcoin.rpc_url);
    println!("Ledger submission: {}", config.node_rpc_url);
    println!("Job interval: {}s", interval.as_secs());

    let ctx = JobContext {
        validator_address,
        btc_key,
        trackers: bridge.trackers.clone(),
        lock_scripts: bridge.lock_scripts.clone(),
        chain_driver: bridge.chain_driver(),
        bitcoin: Arc::new(BitcoinClient::from_config(&config.bitcoin)?),
        explorer: Arc::new(BlockCypherExplorer::new(&config.explorer)),
        submitter: Arc::new(HttpSubmitter::new(&config.node_rpc_url)),
        max_broadcast_retries: config.jobs.max_broadcast_retries,
    };
    println!("🔑 Signing as {}", ctx.btc_pubkey());

    let runner = JobRunner::new(bridge.jobs.clone(), Arc::new(ctx), interval);
    let rescheduled = runner.reschedule_pending()?;
    let trackers = bridge.trackers.list()?;
    println!(
        "📋 {} trackers, {} busy, {} jobs rescheduled",
        trackers.len(),
        trackers.iter().filter(|t| t.is_busy()).count(),
        rescheduled
    );

    println!("\n🚀 Bridge node is running...");
    println!("Press Ctrl+C to stop\n");

    tokio::select! {
        result = runner.run() => {
            if let Err(e) = result {
                log::error!("Job runner stopped: {}", e);
                println!("❌ Job runner stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n🛑 Received shutdown signal");
        }
    }

    let pending = bridge.jobs.list_jobs()?.len();
    println!("📊 {} jobs left in the queue", pending);
    println!("🌉 Bridge node stopped");
    Ok(())
}
