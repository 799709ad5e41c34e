mod config;

use blobd_core::{
    download_from_blob_server, BlobClient, BlobError, BlobKey, BlobServer, BlobType, JobId, Result,
};
use clap::{Parser, Subcommand};
use config::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "blobd")]
#[command(about = "Content-addressed BLOB server for distributing job artifacts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a BLOB server until interrupted
    Server {
        /// Path to configuration file; defaults plus BLOBD_* variables if omitted
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Upload a file and print the key it was stored under
    Put {
        /// Server address, e.g. 127.0.0.1:50100
        #[arg(long)]
        addr: String,

        /// Job id (32 hex digits); required for permanent blobs
        #[arg(long)]
        job: Option<String>,

        /// Store as a permanent blob instead of a transient one
        #[arg(long, default_value_t = false)]
        permanent: bool,

        /// Path to configuration file for client settings
        #[arg(short, long)]
        config: Option<String>,

        file: PathBuf,
    },
    /// Download a blob into a file
    Get {
        /// Server address, e.g. 127.0.0.1:50100
        #[arg(long)]
        addr: String,

        /// Job id (32 hex digits) the blob belongs to
        #[arg(long)]
        job: Option<String>,

        /// Key as printed by `put`
        #[arg(long)]
        key: String,

        /// Path to configuration file for client settings
        #[arg(short, long)]
        config: Option<String>,

        out: PathBuf,
    },
}

fn load_config(path: Option<&str>) -> Config {
    let loaded = match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    };
    match loaded {
        Ok(config) => config,
        Err(error) => {
            tracing::error!("Failed to load config: {}", error);
            std::process::exit(1);
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| BlobError::Config(format!("could not resolve server address '{}'", addr)))
}

fn parse_job(job: Option<String>) -> Result<Option<JobId>> {
    job.map(|job| job.parse::<JobId>()).transpose()
}

async fn run_server(cfg: Config) -> Result<()> {
    let blob_store = cfg.build_blob_store().await?;
    let server = BlobServer::bind(cfg.server.clone(), blob_store).await?;
    server.start();

    tracing::info!(
        "BLOB server listening on port {}, storage at {}",
        server.port(),
        server.storage_dir().display()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down BLOB server");
    server.close().await
}

async fn run_put(
    cfg: Config,
    addr: &str,
    job: Option<String>,
    permanent: bool,
    file: PathBuf,
) -> Result<()> {
    let addr = resolve(addr).await?;
    let job = parse_job(job)?;
    let blob_type = if permanent {
        BlobType::Permanent
    } else {
        BlobType::Transient
    };

    let mut client = BlobClient::connect(addr, &cfg.client).await?;
    let mut reader = tokio::fs::File::open(&file).await?;
    let key = client.put_reader(job.as_ref(), &mut reader, blob_type).await?;
    client.close().await?;

    tracing::info!("Uploaded {} to {}", file.display(), addr);
    println!("{}", key);
    Ok(())
}

async fn run_get(
    cfg: Config,
    addr: &str,
    job: Option<String>,
    key: &str,
    out: PathBuf,
) -> Result<()> {
    let addr = resolve(addr).await?;
    let job = parse_job(job)?;
    let key: BlobKey = key.parse()?;

    let length = download_from_blob_server(addr, &cfg.client, job.as_ref(), &key, &out).await?;
    tracing::info!("Downloaded {} ({} bytes) to {}", key, length, out.display());
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blobd=info,blobd_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Server { config } => {
            match config.as_deref() {
                Some(path) => tracing::info!("Starting BLOB server with config: {}", path),
                None => tracing::info!("Starting BLOB server with default config"),
            }
            let cfg = load_config(config.as_deref());
            run_server(cfg).await
        }
        Commands::Put {
            addr,
            job,
            permanent,
            config,
            file,
        } => {
            let cfg = load_config(config.as_deref());
            run_put(cfg, &addr, job, permanent, file).await
        }
        Commands::Get {
            addr,
            job,
            key,
            config,
            out,
        } => {
            let cfg = load_config(config.as_deref());
            run_get(cfg, &addr, job, &key, out).await
        }
    };

    if let Err(error) = result {
        tracing::error!("blobd error: {}", error);
        std::process::exit(1);
    }
}
