mod config;
mod lint;

use std::process;

use clap::{Parser, Subcommand};
use flagsync_lib::{Document, FlagStore, MemoryStore, Reconciler, SledStore, SqliteStore, StoreError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{FlagsyncConfig, StorageBackend};

#[derive(Parser, Debug)]
#[command(name = "flagsync")]
#[command(version)]
#[command(about = "Synchronize a feature flag document into a flag store", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init, // creates flags.yaml with a demo flag
    Validate {
        /// Path to the flag document to validate
        #[arg(short = 'f', long = "file", default_value = "flags.yaml")]
        file: String,
    },
    Sync {
        /// Path to the flag document (overrides the config file)
        #[arg(short = 'f', long = "file")]
        file: Option<String>,

        /// Path to config file
        #[arg(short = 'c', long = "config", default_value = "flagsync.toml")]
        config: String,

        /// Name recorded on the snapshots this run writes
        #[arg(long = "actor")]
        actor: Option<String>,
    },
    List {
        /// Path to config file
        #[arg(short = 'c', long = "config", default_value = "flagsync.toml")]
        config: String,
    },
    History {
        /// Flag name
        flag: String,

        /// Path to config file
        #[arg(short = 'c', long = "config", default_value = "flagsync.toml")]
        config: String,
    },
}

const INIT_DOCUMENT: &str = r#"flags:
  new-checkout:
    description: Redesigned checkout flow
    enabled: true
    variants:
      - key: on
      - key: off
    segments:
      - description: internal staff
        rollout: 100
        constraints:
          - property: email
            operator: "=~"
            value: "@example\\.com$"
        distributions:
          - key: on
            percent: 100
      - description: everyone else
        rollout: 20
        distributions:
          - key: on
            percent: 50
          - key: off
            percent: 50
"#;

fn run_init() {
    if std::path::Path::new("flags.yaml").exists() {
        error!("flags.yaml already exists in current folder");
        process::exit(1);
    }

    std::fs::write("flags.yaml", INIT_DOCUMENT).unwrap_or_else(|e| {
        error!("Failed to create flags.yaml: {}", e);
        process::exit(1);
    });

    println!("Created flags.yaml");
}

fn run_validate(path: &str) {
    if lint::run_lint(path).is_err() {
        process::exit(1);
    }
}

fn load_config(path: &str) -> FlagsyncConfig {
    let mut config = FlagsyncConfig::load(path);
    config.apply_env_overrides();
    config
}

fn open_store(config: &FlagsyncConfig) -> Result<Box<dyn FlagStore>, StoreError> {
    let store: Box<dyn FlagStore> = match config.store.backend {
        StorageBackend::Sqlite => Box::new(SqliteStore::open(&config.store.path)?),
        StorageBackend::Sled => Box::new(SledStore::open(&config.store.path)?),
        StorageBackend::Memory => Box::new(MemoryStore::new()),
    };
    info!(backend = ?config.store.backend, path = %config.store.path, "Opened flag store");
    Ok(store)
}

fn open_store_or_exit(config: &FlagsyncConfig) -> Box<dyn FlagStore> {
    open_store(config).unwrap_or_else(|e| {
        error!("Failed to open {:?} store: {}", config.store.backend, e);
        process::exit(1);
    })
}

fn run_sync(file: Option<String>, config_path: &str, actor: Option<String>) {
    let mut config = load_config(config_path);
    if let Some(file) = file {
        config.document = file;
    }
    if let Some(actor) = actor {
        config.actor = actor;
    }

    let document = Document::from_path(&config.document).unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });

    let store = open_store_or_exit(&config);
    let report = Reconciler::new(store.as_ref())
        .actor(&config.actor)
        .synchronize(&document)
        .unwrap_or_else(|e| {
            error!("Synchronization failed: {}", e);
            process::exit(1);
        });

    for flag in &report.flags {
        println!(
            "{}: {} variants (-{}), segments {} updated, {} created, {} deleted",
            flag.name,
            flag.variants,
            flag.variants_deleted,
            flag.segments_updated,
            flag.segments_created,
            flag.segments_deleted
        );
    }
    println!(
        "synchronized {} flags from {}, deleted {}",
        report.flags.len(),
        config.document,
        report.flags_deleted
    );
}

fn run_list(config_path: &str) {
    let config = load_config(config_path);
    let store = open_store_or_exit(&config);

    let result = store.list_flags().and_then(|flags| {
        for flag in flags {
            let segments = store.list_segments(flag.id)?;
            let state = if flag.enabled { "enabled" } else { "disabled" };
            if flag.description.is_empty() {
                println!("{} [{}] {} segments", flag.name, state, segments.len());
            } else {
                println!(
                    "{} [{}] {} segments ({})",
                    flag.name,
                    state,
                    segments.len(),
                    flag.description
                );
            }
        }
        Ok(())
    });

    if let Err(e) = result {
        error!("Failed to list flags: {}", e);
        process::exit(1);
    }
}

fn run_history(flag_name: &str, config_path: &str) {
    let config = load_config(config_path);
    let store = open_store_or_exit(&config);

    let result = store.list_flags().and_then(|flags| {
        let Some(flag) = flags.into_iter().find(|f| f.name == flag_name) else {
            return Ok(false);
        };
        for snapshot in store.list_snapshots(flag.id)? {
            println!(
                "#{} {} by {} {}",
                snapshot.id,
                snapshot.created_at.to_rfc3339(),
                snapshot.updated_by,
                &snapshot.hash[..snapshot.hash.len().min(12)]
            );
        }
        Ok(true)
    });

    match result {
        Ok(true) => {}
        Ok(false) => {
            error!("Flag {} not found", flag_name);
            process::exit(1);
        }
        Err(e) => {
            error!("Failed to read history of {}: {}", flag_name, e);
            process::exit(1);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Args::parse();
    match cli.cmd {
        Command::Init => run_init(),
        Command::Validate { file } => run_validate(&file),
        Command::Sync {
            file,
            config,
            actor,
        } => run_sync(file, &config, actor),
        Command::List { config } => run_list(&config),
        Command::History { flag, config } => run_history(&flag, &config),
    }
}
