//! Buildbox - remote build service with an HTTP API.
//!
//! Usage:
//!   buildbox [serve] [--port 8000] [--workers 5]              # Start HTTP server
//!   buildbox build <package> --archive src.tar [--out FILE]   # One local build

use std::path::PathBuf;
use std::process::exit;

use buildbox::archive::{ArchiveStream, UnpackOptions};
use buildbox::executor::{self, BuildExecutor};
use buildbox::job::{BuildRequest, PackagePath};
use buildbox::sandbox::SandboxPool;
use buildbox::{http_server, worker, AppState, Config};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "buildbox")]
#[command(about = "Remote build service: upload sources, get a binary back")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server (default)
    Serve {
        /// Port to listen on (overrides PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Number of build workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Build one archive locally and write the binary to disk
    Build {
        /// Package to build, e.g. example/hello
        package: String,

        /// Source archive (tar or tar.gz)
        #[arg(long)]
        archive: PathBuf,

        /// Allow dependency fetches over insecure transport
        #[arg(long)]
        insecure: bool,

        /// Where to write the binary (defaults to the package's last segment)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    match args.command.unwrap_or(Commands::Serve {
        port: None,
        workers: None,
    }) {
        Commands::Serve { port, workers } => {
            config.port = port.unwrap_or(config.port);
            config.workers = workers.unwrap_or(config.workers);
            if let Err(e) = config.validate() {
                eprintln!("Error: {}", e);
                exit(1);
            }
            serve(config).await;
        }
        Commands::Build {
            package,
            archive,
            insecure,
            out,
        } => {
            exit(build_local(config, &package, archive, insecure, out).await);
        }
    }
}

async fn serve(config: Config) {
    // Nothing can be served without a working toolchain.
    let info = match executor::toolchain_info(&config.toolchain) {
        Ok(info) => info,
        Err(e) => {
            eprintln!("Error: toolchain unavailable: {}", e);
            exit(1);
        }
    };

    let port = config.port;
    let state = match AppState::start(config, info) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    if let Err(e) = http_server::run_server(port, state).await {
        eprintln!("Error: server failed: {}", e);
        exit(1);
    }
}

async fn build_local(
    config: Config,
    package: &str,
    archive: PathBuf,
    insecure: bool,
    out: Option<PathBuf>,
) -> i32 {
    let package = match PackagePath::parse(package) {
        Ok(package) => package,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let file = match tokio::fs::File::open(&archive).await {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error: open {}: {}", archive.display(), e);
            return 1;
        }
    };
    // A private root keeps this run away from a server's slots.
    let root = config.sandbox_root.join(format!("local-{}", Uuid::new_v4()));
    let mut slot = match SandboxPool::new(&root, 1) {
        Ok(pool) => pool.into_slots().remove(0),
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let executor = BuildExecutor::new(config.toolchain.clone());
    let request = BuildRequest::new(package, insecure);
    let out = out.unwrap_or_else(|| PathBuf::from(request.package.binary_name()));
    info!(package = %request.package, archive = %archive.display(), "Local build");

    let outcome = worker::build_once(
        &mut slot,
        &executor,
        &request,
        ArchiveStream::new(file, config.max_archive_bytes),
        &CancellationToken::new(),
        UnpackOptions {
            preserve_permissions: config.preserve_permissions,
        },
    )
    .await;
    if let Err(e) = tokio::fs::remove_dir(&root).await {
        warn!(path = %root.display(), error = %e, "Could not remove local sandbox root");
    }

    match outcome {
        Ok(mut artifact) => {
            let copied = async {
                let mut dest = tokio::fs::File::create(&out).await?;
                tokio::io::copy(&mut artifact.file, &mut dest).await
            }
            .await;
            match copied {
                Ok(bytes) => {
                    println!("{} ({} bytes)", out.display(), bytes);
                    0
                }
                Err(e) => {
                    eprintln!("Error: write {}: {}", out.display(), e);
                    1
                }
            }
        }
        Err(e) => {
            if let Some(log) = e.log() {
                eprint!("{}", String::from_utf8_lossy(log));
            }
            eprintln!("Error: {}", e);
            1
        }
    }
}
