//! policy-cli: check, merge and inspect mesh policy files

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use serde_json::json;

use mesh_policy::config::PolicyEngineConfig;
use mesh_policy::{
    compatible, create_terms_and_conditions, load_engine_config, merge_all_producers, read_policy_file, KeyManager,
    Policy, PolicyManager, PolicyWatcher, SignatureVerifier,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a producer policy can serve a consumer policy
    Check {
        /// Producer policy file
        producer: PathBuf,

        /// Consumer policy file
        consumer: PathBuf,
    },

    /// Merge two or more producer policies into one
    Merge {
        /// Producer policy files
        #[arg(required = true, num_args = 2..)]
        producers: Vec<PathBuf>,
    },

    /// Build the terms and conditions of an agreement
    Terms {
        /// Producer policy file
        producer: PathBuf,

        /// Consumer policy file, supplies the workload
        consumer: PathBuf,

        /// Agreement id, generated when omitted
        #[arg(long)]
        agreement_id: Option<String>,
    },

    /// Validate a single policy file
    Validate {
        /// Policy file
        policy: PathBuf,

        /// Public key file or directory for workload signature checks
        #[arg(long)]
        keys: Option<PathBuf>,
    },

    /// List the policies of a policy directory
    List {
        /// Policy directory, defaults to the configured one
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Pick the workload to deploy after failures at a priority
    #[command(name = "next-workload")]
    NextWorkload {
        /// Policy file
        policy: PathBuf,

        /// Priority that has been failing, 0 for the best choice
        #[arg(long, default_value_t = 0)]
        priority: u32,

        /// Failures seen at that priority
        #[arg(long, default_value_t = 0)]
        retry_count: u32,

        /// Unix time of the first failure at that priority
        #[arg(long, default_value_t = 0)]
        retry_start: u64,
    },

    /// Load a policy directory and follow changes until interrupted
    Watch {
        /// Policy directory, defaults to the configured one
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Seconds between rescans, defaults to the configured interval or 10
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn load_policy(path: &Path) -> Result<Policy> {
    read_policy_file(path).with_context(|| format!("Failed to load policy from {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    // Another logger may already be installed, e.g. under a test harness
    let _ = env_logger::Builder::from_env(env).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_engine_config(path)?,
        None => PolicyEngineConfig::default(),
    };
    init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
    debug!("Using configuration {:?}", config);

    match cli.command {
        Commands::Check { producer, consumer } => {
            let producer = load_policy(&producer)?;
            let consumer = load_policy(&consumer)?;
            match compatible(&producer, &consumer) {
                Ok(()) => print_json(&json!({ "compatible": true })),
                Err(e) => {
                    print_json(&json!({ "compatible": false, "reason": e.to_string() }))?;
                    bail!("{} is not compatible with {}", producer, consumer)
                }
            }
        }

        Commands::Merge { producers } => {
            let policies = producers
                .iter()
                .map(|path| load_policy(path))
                .collect::<Result<Vec<_>>>()?;
            let merged = merge_all_producers(&policies).context("Producer policies are not compatible")?;
            print_json(&merged)
        }

        Commands::Terms {
            producer,
            consumer,
            agreement_id,
        } => {
            let producer = load_policy(&producer)?;
            let consumer = load_policy(&consumer)?;
            let agreement_id = agreement_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

            let workload = consumer
                .next_highest_priority_workload(0, 0, 0)
                .with_context(|| format!("{} has no workload to deploy", consumer))?;
            let terms = create_terms_and_conditions(
                &producer,
                &consumer,
                workload,
                &agreement_id,
                &config.policy.default_workload_password,
            )
            .context("Unable to create terms and conditions")?;
            info!("Created terms for agreement {}", agreement_id);
            print_json(&json!({ "agreementId": agreement_id, "terms": terms }))
        }

        Commands::Validate { policy, keys } => {
            let path = policy;
            let policy = load_policy(&path)?;
            let key_manager = KeyManager::new();
            let key_path = keys.or_else(|| config.policy.key_path.clone());
            let signatures = key_path
                .as_deref()
                .map(|keys| (&key_manager as &dyn SignatureVerifier, keys));
            policy
                .is_self_consistent(signatures)
                .with_context(|| format!("{} is not valid", path.display()))?;
            print_json(&json!({ "policy": policy.header.name, "valid": true }))
        }

        Commands::List { dir } => {
            let dir = dir.unwrap_or_else(|| config.policy.directory.clone());
            let manager = PolicyManager::initialize(&dir)
                .with_context(|| format!("Failed to load policies from {}", dir.display()))?;
            let listing: Vec<_> = manager
                .get_all_policies()
                .iter()
                .map(|p| {
                    json!({
                        "name": p.header.name,
                        "version": p.header.version,
                        "maxAgreements": p.max_agreements,
                        "workloads": p.workloads.len(),
                    })
                })
                .collect();
            print_json(&listing)
        }

        Commands::NextWorkload {
            policy,
            priority,
            retry_count,
            retry_start,
        } => {
            let policy = load_policy(&policy)?;
            let workload = policy
                .next_highest_priority_workload(priority, retry_count, retry_start)
                .with_context(|| format!("{} has no workloads", policy))?;
            print_json(workload)
        }

        Commands::Watch { dir, interval } => {
            let dir = dir.unwrap_or_else(|| config.policy.directory.clone());
            let interval = interval
                .map(Duration::from_secs)
                .or_else(|| config.policy.watch_interval())
                .unwrap_or(Duration::from_secs(10));

            let mut watcher = PolicyWatcher::new(&dir);
            if let Some(keys) = &config.policy.key_path {
                watcher = watcher.with_signature_check(Arc::new(KeyManager::new()), keys.clone());
            }
            let manager = Arc::new(
                PolicyManager::initialize_from(&mut watcher)
                    .with_context(|| format!("Failed to load policies from {}", dir.display()))?,
            );
            info!("Loaded {} policies from {}", manager.number_policies(), dir.display());

            let handle = watcher.spawn(interval, manager.clone());
            manager.attach_watcher(handle)?;

            tokio::signal::ctrl_c().await.context("Failed to listen for interrupt")?;
            info!("Shutting down");
            manager.shutdown().await?;
            Ok(())
        }
    }
}
