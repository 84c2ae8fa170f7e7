use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use broadcast_hub::{
    cli::{Cli, Command, ServeArgs},
    client,
    hub::Hub,
    tcp::TcpFrontend,
    web,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let (hub, hub_task) = Hub::spawn(args.hub_config());
    let stop = CancellationToken::new();

    let tcp_task = match args.tcp {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind tcp frontend on {addr}"))?;
            let frontend = TcpFrontend::new(listener, hub.clone(), args.max_frame_bytes);
            info!("tcp frontend listening on {}", frontend.local_addr()?);
            Some(tokio::spawn(
                frontend.run_until(stop.clone().cancelled_owned()),
            ))
        }
        None => None,
    };

    let listener = TcpListener::bind(args.http)
        .await
        .with_context(|| format!("failed to bind http frontend on {}", args.http))?;
    info!("http frontend listening on {}", listener.local_addr()?);
    let http_task = tokio::spawn(web::serve(
        listener,
        hub.clone(),
        stop.clone().cancelled_owned(),
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    info!("shutting down");
    stop.cancel();

    // Releasing members ends every session still attached to a frontend.
    if let Err(err) = hub.shutdown().await {
        warn!(error = ?err, "hub already stopped");
    }
    let _ = hub_task.await;

    if let Some(task) = tcp_task {
        task.await??;
    }
    http_task.await??;

    Ok(())
}

