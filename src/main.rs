mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use plugbus_core::PluginKey;
use plugbus_store::{Database, SqliteStore};
use plugbus_telemetry::{init_telemetry, LogQuery, SqliteLogSink};

use crate::config::BrokerConfig;

#[derive(Debug, Parser)]
#[command(name = "plugbus", version, about = "msgpack-rpc plugin broker")]
struct Cli {
    /// Config file (defaults to ~/.plugbus/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the broker.
    Serve,
    /// Print a fresh random plugin key.
    Keygen {
        /// Also add the key to the whitelist.
        #[arg(long)]
        whitelist: bool,
        #[arg(long)]
        label: Option<String>,
    },
    /// Manage the keys allowed to connect.
    Whitelist {
        #[command(subcommand)]
        action: WhitelistAction,
    },
    /// List registered plugins and their functions.
    Plugins {
        #[arg(long)]
        json: bool,
    },
    /// Show persisted warn+ log records, newest first.
    Logs {
        #[arg(long)]
        level: Option<String>,
        /// Substring of the event target, e.g. `plugbus_engine`.
        #[arg(long)]
        target: Option<String>,
        /// Key fingerprint as printed in log lines.
        #[arg(long)]
        plugin: Option<String>,
        #[arg(long)]
        call_id: Option<String>,
        /// RFC 3339 timestamp lower bound.
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum WhitelistAction {
    Add {
        /// Base64-encoded 32-byte key.
        key: PluginKey,
        #[arg(long)]
        label: Option<String>,
    },
    Remove {
        key: PluginKey,
    },
    List {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BrokerConfig::load(cli.config.as_deref())?;

    let mut telemetry = config.telemetry_config()?;
    if !matches!(cli.command, Command::Serve) {
        // keep admin output clean
        telemetry.log_level = Level::WARN;
        telemetry.log_to_sqlite = false;
    }
    let _telemetry = init_telemetry(telemetry);

    match cli.command {
        Command::Serve => serve(&config).await,
        Command::Keygen { whitelist, label } => {
            let key = PluginKey::generate();
            if whitelist {
                open_store(&config)?.whitelist().add(&key, label.as_deref())?;
            }
            println!("{key}");
            Ok(())
        }
        Command::Whitelist { action } => run_whitelist(&open_store(&config)?, action),
        Command::Plugins { json } => list_plugins(&open_store(&config)?, json),
        Command::Logs {
            level,
            target,
            plugin,
            call_id,
            since,
            limit,
            json,
        } => {
            let query = LogQuery {
                level,
                target,
                plugin_key: plugin,
                call_id,
                since,
                limit: Some(limit),
            };
            show_logs(&config.telemetry.log_db_path, &query, json)
        }
    }
}

fn open_store(config: &BrokerConfig) -> Result<SqliteStore> {
    let db = Database::open(&config.database.path)
        .with_context(|| format!("opening database at {}", config.database.path.display()))?;
    Ok(SqliteStore::new(db))
}

async fn serve(config: &BrokerConfig) -> Result<()> {
    let store = open_store(config)?;
    let whitelisted = store.whitelist().list()?.len();
    if whitelisted == 0 {
        tracing::warn!("whitelist is empty; no plugin will be able to connect");
    }

    let handle = plugbus_server::start(config.server_config(), Arc::new(store))
        .await
        .context("starting broker")?;
    info!(addr = %handle.addr, whitelisted, "broker ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    info!(stats = ?handle.stats(), "shutting down");
    handle.shutdown().await;
    Ok(())
}

fn run_whitelist(store: &SqliteStore, action: WhitelistAction) -> Result<()> {
    let whitelist = store.whitelist();
    match action {
        WhitelistAction::Add { key, label } => {
            if whitelist.add(&key, label.as_deref())? {
                println!("added {key}");
            } else {
                println!("{key} is already whitelisted");
            }
        }
        WhitelistAction::Remove { key } => {
            if whitelist.remove(&key)? {
                println!("removed {key}");
            } else {
                anyhow::bail!("{key} is not whitelisted");
            }
        }
        WhitelistAction::List { json } => {
            let entries = whitelist.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!(
                        "{}  {}  {}",
                        entry.key,
                        entry.added_at,
                        entry.label.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }
    Ok(())
}

fn list_plugins(store: &SqliteStore, json: bool) -> Result<()> {
    let repo = store.plugins();
    let mut listing = Vec::new();
    for row in repo.list()? {
        let functions = repo.functions(&row.key)?;
        listing.push((row, functions));
    }

    if json {
        let value: Vec<_> = listing
            .iter()
            .map(|(row, functions)| {
                serde_json::json!({
                    "key": row.key.to_base64(),
                    "name": row.name,
                    "description": row.description,
                    "author": row.author,
                    "license": row.license,
                    "registered_at": row.registered_at,
                    "functions": functions,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (row, functions) in listing {
        println!("{} ({}) by {} [{}]", row.name, row.key.fingerprint(), row.author, row.license);
        for f in functions {
            let args: Vec<_> = f.args.iter().map(|k| k.to_string()).collect();
            println!("    {}({})  {}", f.name, args.join(", "), f.description);
        }
    }
    Ok(())
}

fn show_logs(path: &Path, query: &LogQuery, json: bool) -> Result<()> {
    let sink = SqliteLogSink::new(path).with_context(|| format!("opening log database at {}", path.display()))?;
    let records = sink.query(query)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for r in records {
        let key = r.plugin_key.as_deref().unwrap_or("-");
        println!("{} {:5} {} [{key}] {}", r.timestamp, r.level, r.target, r.message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_whitelist_add() {
        let key = PluginKey::generate();
        let cli = Cli::parse_from(["plugbus", "whitelist", "add", &key.to_base64(), "--label", "calc"]);
        match cli.command {
            Command::Whitelist {
                action: WhitelistAction::Add { key: parsed, label },
            } => {
                assert_eq!(parsed, key);
                assert_eq!(label.as_deref(), Some("calc"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_short_key() {
        let result = Cli::try_parse_from(["plugbus", "whitelist", "remove", "AAAA"]);
        assert!(result.is_err());
    }

    #[test]
    fn parses_log_filters() {
        let cli = Cli::parse_from(["plugbus", "logs", "--level", "warn", "--plugin", "AbCdEfGh", "--limit", "5"]);
        match cli.command {
            Command::Logs {
                level, plugin, limit, json, ..
            } => {
                assert_eq!(level.as_deref(), Some("warn"));
                assert_eq!(plugin.as_deref(), Some("AbCdEfGh"));
                assert_eq!(limit, 5);
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn show_logs_on_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.db");
        show_logs(&path, &LogQuery::default(), true).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn whitelist_commands_against_store() {
        let store = SqliteStore::new(Database::in_memory().unwrap());
        let key = PluginKey::generate();
        run_whitelist(&store, WhitelistAction::Add { key, label: None }).unwrap();
        assert!(store.whitelist().contains(&key).unwrap());

        run_whitelist(&store, WhitelistAction::Remove { key }).unwrap();
        assert!(!store.whitelist().contains(&key).unwrap());
        assert!(run_whitelist(&store, WhitelistAction::Remove { key }).is_err());
    }
}
