//! ShardMeta Admin - store maintenance command line interface
//!
//! Deploys and upgrades the global and local metadata stores, lists what
//! they hold and resolves operations left pending by interrupted calls.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use shardmeta_common::config::PendingResolution;
use shardmeta_common::{Config, SchemaVersion, ShardLocation};
use shardmeta_manager::{ManagerConfig, ShardMapManager};
use shardmeta_store::{DiskStoreProvider, MemoryStoreProvider, StoreProvider};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardmeta-admin")]
#[command(about = "ShardMeta metadata store administration")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/shardmeta/shardmeta.toml")]
    config: PathBuf,

    /// Store directory (overrides the config file)
    #[arg(long, env = "SHARDMETA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy the global store
    Deploy {
        /// Version to deploy at (latest by default)
        #[arg(long)]
        version: Option<SchemaVersion>,
    },
    /// Upgrade a store
    Upgrade {
        #[command(subcommand)]
        target: UpgradeTarget,
    },
    /// Show store versions
    Version,
    /// List shard maps
    Maps,
    /// List distinct shard locations
    Locations,
    /// List pending operations
    Pending,
    /// Resolve every pending operation
    Recover {
        /// Finish the operations instead of rolling them back
        #[arg(long)]
        resume: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UpgradeTarget {
    /// Upgrade the global store
    Global {
        #[arg(long)]
        to: Option<SchemaVersion>,
    },
    /// Upgrade one shard's local store
    Local {
        /// Shard location, `[tcp:]server[,port]/database`
        location: ShardLocation,
        #[arg(long)]
        to: Option<SchemaVersion>,
    },
}

/// Load the config file if it exists, then apply command line overrides
fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };
    if let Some(dir) = &args.data_dir {
        config.store.data_dir.clone_from(dir);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.logging.json |= args.log_json;
    Ok(config)
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn open_stores(config: &Config) -> Arc<dyn StoreProvider> {
    if config.store.in_memory {
        debug!("Using in-memory stores");
        Arc::new(MemoryStoreProvider::new())
    } else {
        debug!("Using stores under {}", config.store.data_dir.display());
        Arc::new(DiskStoreProvider::new(&config.store.data_dir))
    }
}

fn version_text(version: Option<SchemaVersion>) -> String {
    version.map_or_else(|| "not deployed".to_string(), |v| v.to_string())
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map_or_else(|| millis.to_string(), |t| t.to_rfc3339())
}

fn run(
    command: Commands,
    stores: &Arc<dyn StoreProvider>,
    manager: &ShardMapManager,
    as_json: bool,
) -> Result<()> {
    match command {
        Commands::Deploy { version } => {
            let deployed = manager.deploy_global_store(version)?;
            info!("Global store at {}", deployed);
            if as_json {
                println!("{}", json!({ "global": deployed.to_string() }));
            } else {
                println!("Global store deployed at {deployed}");
            }
        }
        Commands::Upgrade { target } => {
            let (store, version) = match target {
                UpgradeTarget::Global { to } => {
                    ("global".to_string(), manager.upgrade_global_store(to)?)
                }
                UpgradeTarget::Local { location, to } => {
                    let version = manager.upgrade_local_store(&location, to)?;
                    (location.to_string(), version)
                }
            };
            if as_json {
                println!("{}", json!({ "store": store, "version": version.to_string() }));
            } else {
                println!("{store} store at {version}");
            }
        }
        Commands::Version => {
            let global = manager.global_store_version()?;
            let mut locals = Vec::new();
            for location in stores.local_locations()? {
                let version = manager.local_store_version(&location)?;
                locals.push((location, version));
            }
            if as_json {
                let locals: Vec<_> = locals
                    .iter()
                    .map(|(location, version)| {
                        json!({
                            "location": location.to_string(),
                            "version": version.map(|v| v.to_string()),
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    json!({ "global": global.map(|v| v.to_string()), "local": locals })
                );
            } else {
                println!("{:<40} {}", "STORE", "VERSION");
                println!("{}", "-".repeat(55));
                println!("{:<40} {}", "global", version_text(global));
                for (location, version) in locals {
                    println!("{:<40} {}", location.to_string(), version_text(version));
                }
            }
        }
        Commands::Maps => {
            let maps = manager.get_shard_maps()?;
            let mut rows = Vec::with_capacity(maps.len());
            for map in maps {
                let shards = manager.get_shards(&map)?.len();
                let mappings = manager.get_mappings(&map)?.len();
                rows.push((map, shards, mappings));
            }
            if as_json {
                let rows: Vec<_> = rows
                    .iter()
                    .map(|(map, shards, mappings)| {
                        json!({
                            "id": map.id.to_string(),
                            "name": map.name,
                            "kind": map.kind.to_string(),
                            "key_type": map.key_type.as_str(),
                            "version": map.version.value(),
                            "shards": shards,
                            "mappings": mappings,
                        })
                    })
                    .collect();
                println!("{}", serde_json::Value::Array(rows));
            } else if rows.is_empty() {
                println!("No shard maps found");
            } else {
                println!(
                    "{:<30} {:<8} {:<16} {:>8} {:>10}",
                    "NAME", "KIND", "KEY TYPE", "SHARDS", "MAPPINGS"
                );
                println!("{}", "-".repeat(76));
                for (map, shards, mappings) in rows {
                    println!(
                        "{:<30} {:<8} {:<16} {:>8} {:>10}",
                        map.name,
                        map.kind.to_string(),
                        map.key_type.as_str(),
                        shards,
                        mappings
                    );
                }
            }
        }
        Commands::Locations => {
            let locations = manager
                .get_distinct_shard_locations()?
                .collect::<shardmeta_common::Result<Vec<_>>>()?;
            if as_json {
                let locations: Vec<String> = locations.iter().map(ToString::to_string).collect();
                println!("{}", json!(locations));
            } else {
                for location in locations {
                    println!("{location}");
                }
            }
        }
        Commands::Pending => {
            let pending = manager.pending_operations()?;
            if as_json {
                let rows: Vec<_> = pending
                    .iter()
                    .map(|op| {
                        json!({
                            "id": op.id.to_string(),
                            "shard_map": op.shard_map.name,
                            "kind": op.name(),
                            "state": op.state.to_string(),
                            "attempts": op.attempts,
                            "created_at": format_millis(op.created_at),
                        })
                    })
                    .collect();
                println!("{}", serde_json::Value::Array(rows));
            } else if pending.is_empty() {
                println!("No pending operations");
            } else {
                println!(
                    "{:<38} {:<20} {:<16} {:<24} {:>8}",
                    "ID", "SHARD MAP", "KIND", "STATE", "ATTEMPTS"
                );
                println!("{}", "-".repeat(110));
                for op in pending {
                    println!(
                        "{:<38} {:<20} {:<16} {:<24} {:>8}",
                        op.id.to_string(),
                        op.shard_map.name,
                        op.name(),
                        op.state.to_string(),
                        op.attempts
                    );
                }
            }
        }
        Commands::Recover { resume } => {
            let resolution = if resume {
                PendingResolution::Resume
            } else {
                PendingResolution::Undo
            };
            let mut results = Vec::new();
            for op in manager.pending_operations()? {
                let state = manager.resolve_pending_operation(op.id, resolution)?;
                info!("Resolved {} {} to {}", op.name(), op.id, state);
                results.push((op, state));
            }
            if as_json {
                let rows: Vec<_> = results
                    .iter()
                    .map(|(op, state)| {
                        json!({ "id": op.id.to_string(), "kind": op.name(), "state": state.to_string() })
                    })
                    .collect();
                println!("{}", serde_json::Value::Array(rows));
            } else if results.is_empty() {
                println!("No pending operations");
            } else {
                for (op, state) in results {
                    println!("{} {} -> {}", op.id, op.name(), state);
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config);
    debug!("Config file: {}", args.config.display());

    let stores = open_stores(&config);
    let manager = ShardMapManager::new(Arc::clone(&stores), ManagerConfig::from(&config));
    run(args.command, &stores, &manager, args.json)
}
