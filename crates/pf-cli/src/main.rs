//! `pilotfish` — operator entry point.
//!
//! Exit-code contract: 0 on clean shutdown; non-zero for unrecoverable
//! startup failures (schema mismatch, missing live credentials, config
//! validation). A running process never exits on HALT — HALT is an internal
//! state the operator inspects through `system_state`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;

use pf_config::AppConfig;
use pf_execution::{Clock, PaperVenue, RestVenue, SystemClock, VenueAdapter};
use pf_ingest::{HyperliquidSource, LeaderSource};
use pf_runtime::Runtime;
use pf_schemas::{Baseline, ReasonCode, RunMode, SafetyMode, SafetyState};
use pf_store::Store;

#[derive(Parser)]
#[command(name = "pilotfish")]
#[command(about = "Copy-trading pipeline: mirrors a leader wallet onto a futures venue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline.
    Run {
        /// live | dry-run | backfill-only
        #[arg(long)]
        mode: String,

        /// Layered config paths in merge order (base -> env -> overrides)
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    /// Compute the layered config hash + print canonical JSON.
    ConfigHash {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Store commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,

        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    /// Promote ARMED_SAFE → ARMED_LIVE. Requires --yes.
    Arm {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Explicit confirmation; arming without it is refused.
        #[arg(long)]
        yes: bool,
    },

    /// Operator halt with a reason message.
    Halt {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        reason: String,
    },

    /// Install an active baseline snapshot for reconciliation.
    Baseline {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        id: String,

        /// SYMBOL=QTY pairs; repeat per symbol.
        #[arg(long = "set", required = true)]
        entries: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Open the store, run migrations, print the schema outcome.
    Migrate,
    /// Print the operator-facing system_state keys.
    Status,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn load_app_config(paths: &[String]) -> Result<(AppConfig, pf_config::LoadedConfig)> {
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = pf_config::LoadedConfig::load(&refs)?;
    let cfg = AppConfig::from_loaded(&loaded)?;
    Ok((cfg, loaded))
}

fn store_url(cfg: &AppConfig) -> String {
    format!("sqlite://{}", cfg.store.path)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev-time env bootstrap; absence is fine.
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run { mode, config_paths } => {
            let Some(mode) = RunMode::parse(&mode) else {
                bail!("invalid mode '{mode}'; expected live | dry-run | backfill-only");
            };
            run(mode, &config_paths).await
        }

        Commands::ConfigHash { paths } => {
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            let loaded = pf_config::LoadedConfig::load(&refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
            Ok(())
        }

        Commands::Db { cmd, config_paths } => {
            let (cfg, _) = load_app_config(&config_paths)?;
            let (store, check) = Store::open(&store_url(&cfg)).await?;
            match cmd {
                DbCmd::Migrate => {
                    println!("schema_check={check:?}");
                    println!("migrations_applied=true");
                }
                DbCmd::Status => {
                    for key in [
                        pf_store::keys::SAFETY_MODE,
                        pf_store::keys::SAFETY_REASON_CODE,
                        pf_store::keys::SAFETY_REASON_MESSAGE,
                        pf_store::keys::LAST_PROCESSED_TIMESTAMP_MS,
                        pf_store::keys::LAST_PROCESSED_EVENT_KEY,
                        pf_store::keys::LAST_INGEST_SUCCESS_MS,
                        pf_store::keys::CONFIG_HASH,
                        pf_store::keys::CONFIG_VERSION,
                        pf_store::keys::CONTRACT_VERSION,
                        pf_store::keys::SCHEMA_VERSION,
                        pf_store::keys::MAINTENANCE_SKIP_APPLIED_MS,
                        pf_store::keys::LAST_HEARTBEAT_MS,
                    ] {
                        let value = store.get_system_state(key).await?.unwrap_or_default();
                        println!("{key}={value}");
                    }
                }
            }
            store.close().await;
            Ok(())
        }

        Commands::Arm { config_paths, yes } => {
            if !yes {
                bail!("refusing to arm without --yes");
            }
            let (cfg, _) = load_app_config(&config_paths)?;
            let (store, _) = Store::open(&store_url(&cfg)).await?;
            let prior = store.load_safety().await?;
            match prior.as_ref().map(|p| p.mode) {
                Some(SafetyMode::ArmedSafe) => {
                    let next = SafetyState {
                        mode: SafetyMode::ArmedLive,
                        reason_code: ReasonCode::OperatorAction,
                        reason_message: "operator armed live".to_string(),
                        changed_at_ms: now_ms(),
                    };
                    store.save_safety(prior.as_ref(), &next).await?;
                    println!("armed=true mode=ARMED_LIVE");
                }
                other => {
                    bail!(
                        "cannot arm from {:?}; only ARMED_SAFE may be promoted",
                        other.map(|m| m.as_str())
                    );
                }
            }
            store.close().await;
            Ok(())
        }

        Commands::Halt {
            config_paths,
            reason,
        } => {
            let (cfg, _) = load_app_config(&config_paths)?;
            let (store, _) = Store::open(&store_url(&cfg)).await?;
            let prior = store.load_safety().await?;
            let next = SafetyState {
                mode: SafetyMode::Halt,
                reason_code: ReasonCode::OperatorAction,
                reason_message: reason,
                changed_at_ms: now_ms(),
            };
            store.save_safety(prior.as_ref(), &next).await?;
            println!("halted=true mode=HALT");
            store.close().await;
            Ok(())
        }

        Commands::Baseline {
            config_paths,
            id,
            entries,
        } => {
            let (cfg, _) = load_app_config(&config_paths)?;
            let (store, _) = Store::open(&store_url(&cfg)).await?;

            let mut rows = Vec::with_capacity(entries.len());
            for entry in &entries {
                let (symbol, qty) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("expected SYMBOL=QTY, got '{entry}'"))?;
                let qty: f64 = qty
                    .parse()
                    .with_context(|| format!("bad baseline qty in '{entry}'"))?;
                rows.push(Baseline {
                    baseline_id: id.clone(),
                    symbol: symbol.to_string(),
                    qty,
                    active: true,
                });
            }
            store.install_baseline(&id, &rows).await?;
            println!("baseline_installed={id} symbols={}", rows.len());
            store.close().await;
            Ok(())
        }
    }
}

async fn run(mode: RunMode, config_paths: &[String]) -> Result<()> {
    let (cfg, loaded) = load_app_config(config_paths).context("config validation failed")?;
    let secrets = pf_config::resolve_secrets_for_mode(&cfg, mode)?;

    let (store, schema_check) = Store::open(&store_url(&cfg))
        .await
        .context("store open failed")?;

    let source = Arc::new(HyperliquidSource::new(
        &cfg.leader.rest_url,
        &cfg.leader.ws_url,
        &secrets.leader_wallet,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    match mode {
        RunMode::Live => {
            let api_key = secrets
                .venue_api_key
                .as_deref()
                .context("live mode requires venue credentials")?;
            let api_secret = secrets
                .venue_api_secret
                .as_deref()
                .context("live mode requires venue credentials")?;
            let venue = Arc::new(RestVenue::new(
                "https://fapi.binance.com",
                api_key,
                api_secret,
            )?);
            drive(cfg, loaded, mode, store, schema_check, source, venue, shutdown_rx).await
        }
        RunMode::DryRun | RunMode::BackfillOnly => {
            // Venue writes suppressed: the paper venue runs the full FSM on a
            // deterministic simulated path.
            let venue = Arc::new(PaperVenue::new());
            venue.fill_immediately(true);
            venue.set_now_ms(SystemClock.now_ms());
            drive(cfg, loaded, mode, store, schema_check, source, venue, shutdown_rx).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive<S, V>(
    cfg: AppConfig,
    loaded: pf_config::LoadedConfig,
    mode: RunMode,
    store: Store,
    schema_check: pf_store::SchemaCheck,
    source: Arc<S>,
    venue: Arc<V>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()>
where
    S: LeaderSource + 'static,
    V: VenueAdapter + 'static,
{
    let mut runtime = Runtime::bootstrap(
        cfg, &loaded, mode, store, schema_check, source, venue, shutdown_rx,
    )
    .await?;

    runtime.recover_open_orders().await?;
    runtime.startup().await?;
    runtime.run().await?;

    tracing::info!("clean shutdown");
    Ok(())
}
