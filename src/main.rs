//! Hub Sync server - Binary Entry Point
//!
//! Serves the sync protocol over UDP and, optionally, over TCP streams that
//! already carry WebSocket frames (the HTTP upgrade is done by a fronting
//! proxy), plus an optional HTTP monitoring endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hub_sync::api::create_router;
use hub_sync::utils::init_logging;
use hub_sync::websocket::serve_host;
use hub_sync::{
    EventDispatcher, Hub, HubConfig, HubError, HubResult, InlineExecutor, MemoryDatabase,
    PoolExecutor, TaskExecutor, UdpServer,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExecutionMode {
    /// Run tasks on the receiving task
    Inline,
    /// Run tasks on a rayon thread pool
    Pool,
}

#[derive(Debug, Parser)]
#[command(name = "hub-server", version, about = "Sync hub over UDP and WebSocket")]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP listen address
    #[arg(long, default_value = "127.0.0.1:7400")]
    udp: SocketAddr,

    /// TCP listen address for pre-upgraded WebSocket streams
    #[arg(long)]
    ws: Option<SocketAddr>,

    /// HTTP monitoring listen address
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Log level or filter directive (overrides config and HUB_LOG)
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum, default_value_t = ExecutionMode::Inline)]
    execution: ExecutionMode,
}

#[tokio::main]
async fn main() -> HubResult<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => HubConfig::load(path)?,
        None => HubConfig::default(),
    }
    .with_env()?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    let cancel = CancellationToken::new();
    ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            info!("shutdown requested");
            cancel.cancel();
        }
    })
    .map_err(|e| HubError::Config(format!("cannot install signal handler: {e}")))?;

    let events = Arc::new(EventDispatcher::new());
    let db = Arc::new(
        MemoryDatabase::new(Arc::clone(&events)).with_tokens(config.tokens.clone()),
    );
    let executor: Arc<dyn TaskExecutor> = match args.execution {
        ExecutionMode::Inline => Arc::new(InlineExecutor::new(db)),
        ExecutionMode::Pool => Arc::new(PoolExecutor::new(db)),
    };
    let hub = Hub::new(executor, events, config);

    let mut tasks = Vec::new();

    let udp = UdpServer::bind(args.udp, Arc::clone(&hub), cancel.clone()).await?;
    tasks.push(tokio::spawn(udp.run()));

    if let Some(addr) = args.ws {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "websocket listener bound");
        tasks.push(tokio::spawn(accept_streams(listener, Arc::clone(&hub), cancel.clone())));
    }

    if let Some(addr) = args.http {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "http monitoring bound");
        let router = create_router(Arc::clone(&hub));
        let shutdown = cancel.clone();
        tasks.push(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
            Ok::<(), HubError>(())
        }));
    }

    info!(version = hub_sync::VERSION, "hub server running");
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("server task failed: {}", e),
            Err(e) => error!("server task panicked: {}", e),
        }
    }
    info!("hub server stopped");
    Ok(())
}

async fn accept_streams(
    listener: TcpListener,
    hub: Arc<Hub>,
    cancel: CancellationToken,
) -> HubResult<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "failed to set TCP_NODELAY: {}", e);
        }
        info!(%peer, "websocket stream accepted");

        let hub = Arc::clone(&hub);
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = serve_host(stream, hub, cancel).await {
                warn!(%peer, "websocket session ended with error: {}", e);
            }
        });
    }
}
