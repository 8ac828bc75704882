//! bam-server: BAM sync service
//!
//! Listens on TCP and serves one request per connection using the BAM wire
//! protocol. Each connection runs on a blocking task so download producers
//! write straight into the socket as the client pulls.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::{debug, info, warn};

use bam_server::config::CONFIG_FILE;
use bam_server::{ServerConfig, Service, SvnBackend};

#[derive(Parser)]
#[command(name = "bam-server")]
#[command(about = "Checkout and commit service for BAM asset bundles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a repository
    Serve {
        /// Config file
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,

        /// Listen address, overrides the config file
        #[arg(short, long)]
        listen: Option<String>,

        /// Repository working copy, overrides the config file
        #[arg(short, long)]
        repository: Option<PathBuf>,

        /// Storage directory, overrides the config file
        #[arg(short, long)]
        storage: Option<PathBuf>,
    },
    /// Print version and exit
    Version,
}

fn init_logging() {
    let filter = if std::env::var_os("BAM_VERBOSE").is_some() {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            eprintln!("bam-server {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Serve {
            config,
            listen,
            repository,
            storage,
        } => {
            init_logging();
            let mut config = ServerConfig::load(&config)?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(repository) = repository {
                config.repository = repository;
            }
            if let Some(storage) = storage {
                config.storage = storage;
            }
            config.repository = std::fs::canonicalize(&config.repository)?;
            run_server(config).await?;
        }
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(
        "serving {} on {}",
        config.repository.display(),
        listener.local_addr()?
    );

    let backend = SvnBackend::new(&config.repository);
    let service = Arc::new(Service::new(config, backend)?);

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("connection from {peer}");

        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = handle_connection(&service, stream) {
                warn!("connection from {peer} dropped: {e:#}");
            }
        });
    }
}

fn handle_connection(service: &Service<SvnBackend>, stream: TcpStream) -> Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    let writer = BufWriter::new(stream);
    service.serve(reader, writer)
}
