use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use umbra_lws::address;
use umbra_lws::client::NodeClient;
use umbra_lws::config::{Network, ServerConfig};
use umbra_lws::db::data::RequestType;
use umbra_lws::db::Storage;
use umbra_lws::rest::{self, ApiState};
use umbra_lws::sync::{self, StopSignal};

#[derive(Parser)]
#[command(author, version, about = "Light-wallet server for the umbra network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scanning engine and REST API
    Start {
        /// Address of the full node's message socket
        #[arg(long, default_value = "127.0.0.1:18082")]
        daemon: String,
        /// Bind address for the REST API
        #[arg(long, default_value = "127.0.0.1:8080")]
        rest_bind: SocketAddr,
        /// Directory holding the account database
        #[arg(long, default_value = "lws-db")]
        db_path: PathBuf,
        /// Number of concurrent scan workers; defaults to the hardware
        /// parallelism
        #[arg(long)]
        scan_workers: Option<usize>,
        /// Maximum number of pending account creation requests
        #[arg(long, default_value_t = 50)]
        create_queue_max: usize,
        /// Network the daemon serves
        #[arg(long, default_value = "mainnet")]
        network: Network,
    },
    /// Inspect or resolve pending account requests. The store is opened
    /// directly, so the server must not be running.
    Requests {
        /// Directory holding the account database
        #[arg(long, default_value = "lws-db")]
        db_path: PathBuf,
        /// Network addresses are encoded for
        #[arg(long, default_value = "mainnet")]
        network: Network,
        #[command(subcommand)]
        action: RequestsAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RequestKind {
    Create,
    Import,
}

impl From<RequestKind> for RequestType {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Create => RequestType::Create,
            RequestKind::Import => RequestType::ImportScan,
        }
    }
}

#[derive(Subcommand)]
enum RequestsAction {
    /// List all pending requests
    List,
    /// Accept pending requests for the given addresses
    Accept {
        #[arg(long, value_enum)]
        kind: RequestKind,
        addresses: Vec<String>,
    },
    /// Reject pending requests for the given addresses
    Reject {
        #[arg(long, value_enum)]
        kind: RequestKind,
        addresses: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Start {
            daemon,
            rest_bind,
            db_path,
            scan_workers,
            create_queue_max,
            network,
        } => {
            let scan_workers = scan_workers.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(usize::from)
                    .unwrap_or(1)
            });
            start(ServerConfig {
                network,
                daemon_addr: daemon,
                rest_bind,
                db_path,
                scan_workers,
                create_queue_max,
            })
            .await
        }
        Commands::Requests {
            db_path,
            network,
            action,
        } => requests(&db_path, network, action),
    };

    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

fn flatten(joined: Result<Result<(), umbra_lws::Error>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e).context("task panicked"),
    }
}

async fn start(config: ServerConfig) -> Result<()> {
    let storage = Storage::open(&config.db_path, config.network, config.create_queue_max)
        .context("failed to open account database")?;
    let stop = StopSignal::new();

    // align the local chain tail before anything is served
    {
        let mut client = NodeClient::connect(&config.daemon_addr, stop.subscribe())
            .await
            .with_context(|| format!("failed to connect to daemon at {}", config.daemon_addr))?;
        sync::sync_chain(&mut client, &storage)
            .await
            .context("initial blockchain sync failed")?;
    }

    let api = ApiState::new(storage.clone(), config.network);
    let mut rest_task: JoinHandle<Result<(), umbra_lws::Error>> =
        tokio::spawn(rest::serve(api, config.rest_bind, stop.clone()));

    let scanner_stop = stop.clone();
    let scanner_storage = storage.clone();
    let scanner_config = config.clone();
    let mut scanner_task: JoinHandle<Result<(), umbra_lws::Error>> = tokio::spawn(async move {
        sync::run_scanner(scanner_storage, &scanner_config, scanner_stop).await
    });

    let outcome = tokio::select! {
        res = &mut scanner_task => {
            stop.stop();
            let rest_res = (&mut rest_task).await;
            flatten(res).and(flatten(rest_res))
        }
        res = &mut rest_task => {
            stop.stop();
            let scanner_res = (&mut scanner_task).await;
            flatten(res).and(flatten(scanner_res))
        }
        _ = signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            stop.stop();
            let scanner_res = (&mut scanner_task).await;
            let rest_res = (&mut rest_task).await;
            flatten(scanner_res).and(flatten(rest_res))
        }
    };

    outcome
}

fn requests(db_path: &PathBuf, network: Network, action: RequestsAction) -> Result<()> {
    let storage =
        Storage::open(db_path, network, 1).context("failed to open account database")?;

    match action {
        RequestsAction::List => {
            let reader = storage.start_read()?;
            let mut count = 0;
            for request in reader.get_requests()? {
                let (kind, request) = request?;
                println!(
                    "{:?}\t{}\tstart_height={}\tcreated={}",
                    kind,
                    address::encode(&request.address, network),
                    request.start_height,
                    request.creation,
                );
                count += 1;
            }
            println!("{count} pending request(s)");
        }
        RequestsAction::Accept { kind, addresses } => {
            let addresses = decode_addresses(&addresses, network)?;
            let accepted = storage.accept_requests(kind.into(), &addresses)?;
            for address in &accepted {
                println!("accepted {}", address::encode(address, network));
            }
            println!("{} request(s) accepted", accepted.len());
        }
        RequestsAction::Reject { kind, addresses } => {
            let addresses = decode_addresses(&addresses, network)?;
            let rejected = storage.reject_requests(kind.into(), &addresses)?;
            for address in &rejected {
                println!("rejected {}", address::encode(address, network));
            }
            println!("{} request(s) rejected", rejected.len());
        }
    }
    Ok(())
}

fn decode_addresses(
    addresses: &[String],
    network: Network,
) -> Result<Vec<umbra_lws::db::data::AccountAddress>> {
    addresses
        .iter()
        .map(|s| {
            address::decode(s, network).with_context(|| format!("invalid address \"{s}\""))
        })
        .collect()
}
