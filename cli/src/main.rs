//! eventrelay CLI: watch a bridge contract and relay its `TokensLocked`
//! events to an HTTP endpoint.
//!
//! # Commands
//! ```text
//! eventrelay [run]   poll the source chain and relay new events (default)
//! eventrelay status  print the stored checkpoint and relayed count
//! eventrelay reset   forget the checkpoint (relayed ids are kept)
//! eventrelay version
//! ```

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use eventrelay_core::{Pipeline, PipelineBuilder, PipelineConfig, ProgressStore};
use eventrelay_evm::{EvmChainReader, EvmReaderConfig};
use eventrelay_http::HttpRelayTransport;
use eventrelay_storage::{ProgressBackend, StoreLocation};

mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser, Debug)]
#[command(
    name = "eventrelay",
    about = "Relay bridge TokensLocked events from an EVM chain to an HTTP endpoint",
    version
)]
struct Cli {
    /// Source chain JSON-RPC URL
    #[arg(long, env = "SOURCE_CHAIN_RPC_URL", global = true)]
    rpc_url: Option<String>,

    /// Bridge contract emitting TokensLocked
    #[arg(long, env = "BRIDGE_CONTRACT_ADDRESS", global = true)]
    contract: Option<String>,

    /// Chain id used for the progress key; queried from the node when omitted
    #[arg(long, env = "SOURCE_CHAIN_ID", global = true)]
    chain_id: Option<u64>,

    /// Relay endpoint receiving the JSON payloads
    #[arg(
        long,
        env = "RELAYER_API_ENDPOINT",
        default_value = "https://httpbin.org/post",
        global = true
    )]
    endpoint: String,

    /// Seconds between polling cycles
    #[arg(long, env = "POLLING_INTERVAL_SECONDS", default_value_t = 15, global = true)]
    poll_interval: u64,

    /// On first run, start this many blocks behind the head
    #[arg(long, env = "START_BLOCK_OFFSET", default_value_t = 100, global = true)]
    start_block_offset: u64,

    /// Relay attempts per event, including the first
    #[arg(long, env = "RELAY_MAX_ATTEMPTS", default_value_t = 3, global = true)]
    max_attempts: u32,

    /// Backoff before the second relay attempt (ms)
    #[arg(long, env = "RELAY_BASE_DELAY_MS", default_value_t = 1_000, global = true)]
    base_delay_ms: u64,

    /// Upper bound on a single backoff (ms)
    #[arg(long, env = "RELAY_MAX_DELAY_MS", default_value_t = 30_000, global = true)]
    max_delay_ms: u64,

    /// Timeout of one relay request (ms)
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_MS", default_value_t = 10_000, global = true)]
    request_timeout_ms: u64,

    /// Timeout of one chain query (ms)
    #[arg(long, env = "CHAIN_TIMEOUT_MS", default_value_t = 30_000, global = true)]
    chain_timeout_ms: u64,

    /// Largest block span per eth_getLogs call
    #[arg(long, env = "MAX_BLOCK_RANGE", default_value_t = 2_000, global = true)]
    max_block_range: u64,

    /// Widest block range scanned per cycle; defaults to MAX_BLOCK_RANGE
    #[arg(long, env = "MAX_BLOCKS_PER_CYCLE", global = true)]
    max_blocks_per_cycle: Option<u64>,

    /// Progress store: a JSON file path, or `sqlite:<path>`
    #[arg(
        long,
        env = "PROGRESS_STORE",
        default_value = "relay-progress.json",
        global = true
    )]
    store: String,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Poll the source chain and relay new events (default)
    Run,
    /// Print the stored checkpoint and relayed count
    Status,
    /// Forget the checkpoint; the next run starts from the head offset
    Reset,
    /// Print version
    Version,
}

impl Cli {
    fn reader_config(&self) -> Result<EvmReaderConfig> {
        let rpc_url = self
            .rpc_url
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("SOURCE_CHAIN_RPC_URL (--rpc-url) must be set"))?;
        let contract = self.contract_address()?;
        let config = EvmReaderConfig {
            rpc_url,
            contract_address: contract,
            max_block_range: self.max_block_range,
            request_timeout_ms: self.chain_timeout_ms,
        };
        config.validate()?;
        Ok(config)
    }

    fn contract_address(&self) -> Result<String> {
        self.contract
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("BRIDGE_CONTRACT_ADDRESS (--contract) must be set"))
    }

    fn pipeline_config(&self, stream_id: &str) -> Result<PipelineConfig> {
        let config = PipelineBuilder::new()
            .id(stream_id)
            .poll_interval_ms(self.poll_interval.saturating_mul(1_000))
            .start_block_offset(self.start_block_offset)
            .chain_timeout_ms(self.chain_timeout_ms)
            .max_blocks_per_cycle(self.max_blocks_per_cycle.unwrap_or(self.max_block_range))
            .max_attempts(self.max_attempts)
            .base_delay_ms(self.base_delay_ms)
            .max_delay_ms(self.max_delay_ms)
            .request_timeout_ms(self.request_timeout_ms)
            .build_config()?;
        Ok(config)
    }

    fn store_location(&self) -> Result<StoreLocation> {
        Ok(self.store.parse::<StoreLocation>()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Version => {
            println!("eventrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            init_tracing(&LogConfig {
                level: cli.log_level.clone(),
                json: cli.log_json,
            });
            match command {
                Command::Status => cmd_status(&cli).await,
                Command::Reset => cmd_reset(&cli).await,
                _ => cmd_run(&cli).await,
            }
        }
    }
}

async fn cmd_run(cli: &Cli) -> Result<()> {
    let reader_config = cli.reader_config()?;
    let location = cli.store_location()?;

    let reader = EvmChainReader::connect(&reader_config)
        .await
        .context("cannot connect to the source chain")?;
    let stream_id = reader.stream_id();
    let config = cli.pipeline_config(&stream_id)?;

    let store = ProgressBackend::open(&location, &stream_id)
        .await
        .with_context(|| format!("cannot open progress store {location}"))?;
    let transport = HttpRelayTransport::new(
        cli.endpoint.clone(),
        Duration::from_millis(cli.request_timeout_ms),
    )?;

    tracing::info!(
        stream = %stream_id,
        rpc = %reader_config.rpc_url,
        endpoint = %cli.endpoint,
        store = %location,
        "starting relay"
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            trigger.cancel();
        }
    });

    let store: Arc<dyn ProgressStore> = Arc::new(store);
    let mut pipeline = Pipeline::new(config, reader, store, transport, cancel);
    pipeline.run().await.context("relay pipeline failed to start")?;
    Ok(())
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let store = open_store(cli).await?;
    let snapshot = store.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn cmd_reset(cli: &Cli) -> Result<()> {
    let store = open_store(cli).await?;
    store.reset_checkpoint().await?;
    let snapshot = store.snapshot().await?;
    tracing::info!(
        stream = %snapshot.stream_id,
        relayed = snapshot.relayed_count,
        "checkpoint cleared"
    );
    println!("checkpoint cleared for {}", snapshot.stream_id);
    Ok(())
}

/// Resolve the stream id (asking the node for the chain id unless given) and open its store.
async fn open_store(cli: &Cli) -> Result<ProgressBackend> {
    let location = cli.store_location()?;
    let stream_id = match cli.chain_id {
        Some(chain_id) => {
            let contract: Address = cli
                .contract_address()?
                .parse()
                .context("invalid BRIDGE_CONTRACT_ADDRESS")?;
            stream_id(chain_id, &contract)
        }
        None => {
            let reader = EvmChainReader::connect(&cli.reader_config()?)
                .await
                .context("cannot connect to the source chain")?;
            reader.stream_id()
        }
    };
    ProgressBackend::open(&location, &stream_id)
        .await
        .with_context(|| format!("cannot open progress store {location}"))
}

fn stream_id(chain_id: u64, contract: &Address) -> String {
    format!("{chain_id}:{}", contract.to_checksum(None))
}
