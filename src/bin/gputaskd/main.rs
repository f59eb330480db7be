use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gputask::config::load_config;
use gputask::core::gpu::NvidiaSmiProbe;
use gputask::core::manager::Manager;
use gputask::core::session::TmuxSessionHost;
use gputask::core::store::Store;
use gputask::server;

#[derive(Debug, Parser)]
#[command(name = "gputaskd", author, version, about = "GPU task scheduler daemon")]
struct Cli {
    /// The configuration file to use
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.verbose).init();

    let config = load_config(cli.config.as_ref())?;

    let db_path = config.runtime_dir.join("tasks.db");
    let store = Store::open(&db_path)?;
    let probe = NvidiaSmiProbe::new();
    let session_host = TmuxSessionHost::new();

    let manager = Arc::new(Manager::new(
        store,
        probe,
        session_host,
        config.runtime_dir.clone(),
        std::env::current_dir()?,
        config.resolved_conda_init_script(),
        config.poll_interval(),
    ));

    manager.start().await?;

    let bind_addr = format!("{}:{}", config.daemon.host, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {bind_addr}");

    let app = server::router(Arc::clone(&manager), &config.daemon.cors_origins);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
