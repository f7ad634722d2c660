use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shardis::config::{Config, ConfigError};
use shardis::utils::format_duration;
use shardis::{MessageHandler, ShardedClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardis")]
#[command(about = "Client-side sharding and replication-chain control for Redis-compatible stores")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Shardis Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which shard and node own a key
    Route {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Shard key to route
        key: String,
    },
    /// List shards and their nodes
    Nodes {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Promote a node to master of its shard and relink the chain
    Promote {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Shard index
        #[arg(short, long)]
        shard: usize,
        /// Index of the new master within the shard
        #[arg(short, long)]
        index: usize,
    },
    /// Relink a shard in configuration order with its first node as master
    Reset {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Shard index
        #[arg(short, long)]
        shard: usize,
    },
    /// PING every node and show pool counters
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Print messages published to channels until interrupted
    Subscribe {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Treat the names as patterns
        #[arg(short, long)]
        pattern: bool,
        /// Channels (or patterns) to subscribe to
        #[arg(required = true)]
        channels: Vec<String>,
    },
    /// Generate example configuration files
    Config {
        /// Configuration mode (sharded or replicated)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Route { config, key } => route(config, key).await?,
        Commands::Nodes { config } => nodes(config).await?,
        Commands::Promote {
            config,
            shard,
            index,
        } => promote(config, shard, Some(index)).await?,
        Commands::Reset { config, shard } => promote(config, shard, None).await?,
        Commands::Status { config } => status(config).await?,
        Commands::Subscribe {
            config,
            pattern,
            channels,
        } => subscribe(config, pattern, channels).await?,
        Commands::Config { mode, output } => generate_config(mode, output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

/// Load the configuration, start logging and build a TCP client
fn open_client(config_path: &PathBuf) -> Result<ShardedClient> {
    let config = Config::load_from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config)?;
    info!("Configuration loaded from: {:?}", config_path);

    ShardedClient::connect(config).context("Failed to build client")
}

async fn route(config_path: PathBuf, key: String) -> Result<()> {
    let client = open_client(&config_path)?;
    let router = client.router();
    let shard_key = router.shard_key(key.as_bytes());
    let index = router.route_index(key.as_bytes());
    let chain = client.shard(index)?;

    println!("Key:       {}", key);
    println!("Shard key: {}", String::from_utf8_lossy(shard_key));
    println!("Hash:      {:#018x}", router.ring().hash(shard_key));
    println!("Shard:     {} ({})", index, chain.name());
    println!("Master:    {}", chain.master().await);
    Ok(())
}

async fn nodes(config_path: PathBuf) -> Result<()> {
    let client = open_client(&config_path)?;

    for (index, chain) in client.shards().iter().enumerate() {
        println!("Shard {} ({}):", index, chain.name());
        for (position, node) in chain.current_order().await.iter().enumerate() {
            let role = if position == 0 { "master" } else { "replica" };
            println!("  {:<8} {}", role, node);
        }
    }
    Ok(())
}

async fn promote(config_path: PathBuf, shard: usize, index: Option<usize>) -> Result<()> {
    let client = open_client(&config_path)?;
    let chain = client.shard(shard)?;

    let links = match index {
        Some(index) => client.promote_master(shard, index).await?,
        None => client.reset_replication(shard).await?,
    };

    println!("Shard {} ({}) relinked:", shard, chain.name());
    for link in &links {
        println!("  {}", chain.describe(link));
    }
    Ok(())
}

async fn status(config_path: PathBuf) -> Result<()> {
    let client = open_client(&config_path)?;

    let report = client.health_report().await;
    let stats = client.pool_stats().await;
    let mut unhealthy = 0;

    println!("{:<28} {:<10} {:>8} {:>7} {:>5}", "NODE", "LATENCY", "CREATED", "EVICTED", "IDLE");
    for (health, (_, pool)) in report.iter().zip(stats.iter()) {
        println!(
            "{:<28} {:<10} {:>8} {:>7} {:>5}  {}",
            health.node_id,
            format_duration(health.latency),
            pool.created,
            pool.evicted,
            pool.idle,
            health.status
        );
        if !health.status.is_healthy() {
            unhealthy += 1;
        }
    }

    if unhealthy > 0 {
        bail!("{} of {} nodes are unhealthy", unhealthy, report.len());
    }
    Ok(())
}

struct PrintHandler;

impl MessageHandler for PrintHandler {
    fn on_message(&self, channel: &str, payload: &[u8]) {
        println!("[{}] {}", channel, String::from_utf8_lossy(payload));
    }

    fn on_pmessage(&self, pattern: &str, channel: &str, payload: &[u8]) {
        println!("[{} via {}] {}", channel, pattern, String::from_utf8_lossy(payload));
    }

    fn on_error(&self, error: &shardis::ShardisError) {
        eprintln!("Subscription failed: {}", error);
    }
}

async fn subscribe(config_path: PathBuf, pattern: bool, channels: Vec<String>) -> Result<()> {
    let client = open_client(&config_path)?;
    let handler = Arc::new(PrintHandler);

    let handle = if pattern {
        client.psubscribe(handler, &channels).await?
    } else {
        client.subscribe(handler, &channels).await?
    };
    println!(
        "Subscribed to {} on {}, press Ctrl-C to stop",
        channels.join(", "),
        handle.node()
    );

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = wait_until_inactive(&handle) => false,
    };

    if interrupted {
        if pattern {
            client.punsubscribe::<&str>(&handle, &[])?;
        } else {
            client.unsubscribe::<&str>(&handle, &[])?;
        }
    }
    handle.join().await?;
    Ok(())
}

async fn wait_until_inactive(handle: &shardis::SubscriptionHandle) {
    while handle.is_active() {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

fn generate_config(mode: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  shardis nodes --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Shards: {}", config.shards.len());
            println!("  Nodes: {}", config.node_count());
            println!(
                "  Ring: {} virtual nodes per shard, {:?} hashing",
                config.sharding.virtual_nodes, config.sharding.hashing
            );

            for (i, shard) in config.shards.iter().enumerate() {
                let name = shard.name.clone().unwrap_or_else(|| format!("shard-{}", i));
                println!("    {}: {} node(s)", name, shard.nodes.len());
                for node in &shard.nodes {
                    println!("      {}", node.id());
                }
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("shardis v{}", env!("CARGO_PKG_VERSION"));
    println!("Client-side sharding and replication-chain control for Redis-compatible stores");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Consistent hashing with virtual nodes and key tags");
    println!("  • Master promotion and chain relinking per shard");
    println!("  • Per-context session affinity for WATCH/MULTI/EXEC");
    println!("  • Dedicated-connection subscriptions");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
