//! Slide Host - headless main process for the Slide desktop app.
//!
//! Owns the replicated refs, the event bus and the RPC server, and serves
//! renderers running in other processes over the local socket bridge.

mod handlers;

use anyhow::{Context, Result};
use clap::Parser;
use slide_core::contract::{self, ActiveTasksRef, AppReadyRef, AppReadyState};
use slide_core::{JsonFileStore, KeyValueStore, MemoryStore, Message, SlideRuntime};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "slide-host")]
#[command(about = "Main-process host serving refs, pub/sub and RPC to Slide renderers")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Ref store file (defaults to the platform data directory)
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Keep ref state in memory only
    #[arg(long, conflicts_with = "store_path")]
    ephemeral: bool,

    /// Project root served to renderers (defaults to the current directory)
    #[arg(long)]
    project: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn open_store(args: &Args) -> Result<Arc<dyn KeyValueStore>> {
    if args.ephemeral {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = match &args.store_path {
        Some(path) => JsonFileStore::open(path)?,
        None => JsonFileStore::open_default()?,
    };
    info!("Ref store: {}", store.path().display());
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the port announcement only
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting Slide host");

    let project_root = match &args.project {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("no current directory")?,
    };
    info!("Project root: {}", project_root.display());

    let runtime = SlideRuntime::builder()
        .with_store(open_store(&args)?)
        .with_router(handlers::build_router(project_root)?)
        .declared_procedures(contract::PROCEDURES)
        .build()
        .await?;

    let app_ready = runtime
        .refs()
        .create(
            AppReadyRef::ID,
            AppReadyState::initial(),
            AppReadyRef::schema(),
            None,
        )
        .await?;
    let (_active_tasks, tasks_listener) =
        ActiveTasksRef::track(runtime.refs(), runtime.bus()).await?;

    let addr = runtime
        .start_ipc_server(SocketAddr::new(args.host, args.port))
        .await?;

    app_ready.set(AppReadyState::ready()).await?;
    if !runtime.bus().publish(Message::app_ready()) {
        warn!("Bus closed before the ready announcement");
    }

    // Print port for the launcher to read (intentional stdout for IPC)
    println!("SLIDE_PORT={}", addr.port());

    info!("Slide host serving renderers on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    tasks_listener.stop();
    runtime.shutdown().await;
    Ok(())
}
