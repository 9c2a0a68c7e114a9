// Hello World server binary
// Decision: Explicit runtimes instead of #[tokio::main] so multi-worker mode can own its threads

use anyhow::{Context, Result};
use clap::Parser;
use loadline_server::{default_workers, serve, serve_workers, ServerConfig, DEFAULT_BIND};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hello-server")]
#[command(about = "Serve {\"message\":\"Hello World!\"} on GET /")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "HELLO_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    /// Worker threads, each with its own SO_REUSEPORT listener (default: one per CPU)
    #[arg(long, env = "HELLO_WORKERS", default_value_t = default_workers())]
    workers: usize,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadline_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig {
        bind: args.bind,
        workers: args.workers,
    };
    let shutdown = CancellationToken::new();

    if config.workers <= 1 {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to build runtime")?;
        runtime.block_on(async {
            tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));
            serve(&config, shutdown).await
        })?;
    } else {
        let signal_token = shutdown.clone();
        std::thread::Builder::new()
            .name("hello-signal".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(cancel_on_ctrl_c(signal_token)),
                    Err(e) => tracing::error!(error = %e, "Signal handler unavailable"),
                }
            })
            .context("Failed to spawn signal thread")?;
        serve_workers(&config, shutdown)?;
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
