use carbon_market::application::Marketplace;
use carbon_market::application::auth::AuthService;
use carbon_market::config::MarketConfig;
use carbon_market::domain::ports::Stores;
use carbon_market::infrastructure::in_memory::in_memory_stores;
use carbon_market::infrastructure::simulated::SimulatedServices;
use carbon_market::interfaces::csv::user_reader::UserReader;
use carbon_market::interfaces::http::{self, AppState};
use carbon_market::telemetry::{self, LogFormat};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the marketplace API.
    Serve {
        /// Address to listen on, overriding the configuration file.
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Accounts CSV to load before serving.
        #[arg(long)]
        seed_users: Option<PathBuf>,
    },
    /// Create accounts from a CSV file and print them.
    Seed {
        /// Input accounts CSV file
        input: PathBuf,
    },
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    use carbon_market::infrastructure::rocksdb::RocksDBStore;
    match db_path {
        Some(path) => Ok(RocksDBStore::open(path).into_diagnostic()?.stores()),
        None => Ok(in_memory_stores()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

/// Registers every valid record, returning how many accounts were created.
async fn seed_users<W: Write>(auth: &AuthService, input: &Path, out: &mut W) -> Result<usize> {
    let file = File::open(input).into_diagnostic()?;
    let mut created = 0;
    for record in UserReader::new(file).registrations() {
        match record {
            Ok(registration) => match auth.create_user(registration, true).await {
                Ok(user) => {
                    writeln!(out, "{},{},{:?}", user.id, user.username, user.role)
                        .into_diagnostic()?;
                    created += 1;
                }
                Err(e) => eprintln!("Error creating user: {}", e),
            },
            Err(e) => eprintln!("Error reading user record: {}", e),
        }
    }
    Ok(created)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Error waiting for shutdown signal: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format, "info,tower_http=info");

    let mut config = match &cli.config {
        Some(path) => MarketConfig::from_file(path).into_diagnostic()?,
        None => MarketConfig::default(),
    };
    let stores = open_stores(cli.db_path.as_deref())?;
    let services = SimulatedServices::default().services();

    match cli.command {
        Command::Seed { input } => {
            let market = Marketplace::new(stores, services, &config);
            let stdout = io::stdout();
            let mut out = stdout.lock();
            writeln!(out, "id,username,role").into_diagnostic()?;
            let created = seed_users(&market.auth, &input, &mut out).await?;
            writeln!(out, "seeded {} users", created).into_diagnostic()?;
            market.shutdown().await;
        }
        Command::Serve { bind, seed_users: seed } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let market = Arc::new(Marketplace::new(stores, services, &config));
            if let Some(path) = seed {
                let created = seed_users(&market.auth, &path, &mut io::sink()).await?;
                info!(created, "seed users loaded");
            }
            let resumed = market.resume().await.into_diagnostic()?;
            if resumed > 0 {
                info!(resumed, "pending document approvals resumed");
            }
            let reconciler = market.start_reconciler();
            let state = AppState::new(market.clone(), &config);
            http::serve(state, &config, shutdown_signal())
                .await
                .into_diagnostic()?;

            reconciler.abort();
            let _ = reconciler.await;
            if let Ok(market) = Arc::try_unwrap(market) {
                market.shutdown().await;
            }
        }
    }

    Ok(())
}
