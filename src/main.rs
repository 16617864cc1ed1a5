use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_gateway::relay::refresh::OauthRefresher;
use relay_gateway::relay::{forward, Reporter, RelayState};
use relay_gateway::scheduler::{jobs, Scheduler};
use relay_gateway::store::{PgStore, Store};
use relay_gateway::{auth, cli, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "relay_gateway=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Jobs { command }) => handle_jobs_command(cfg, command).await,
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    }
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("connecting to database");
    let pg = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("running migrations");
    pg.migrate().await?;

    let store: Arc<dyn Store> = Arc::new(pg);
    let reporter = Reporter::spawn(store.clone());
    let refresher = Arc::new(OauthRefresher::new(cfg.http_client_timeout())?);

    let state = RelayState {
        store: store.clone(),
        reporter: reporter.handle(),
        refresher: refresher.clone(),
        config: cfg.clone(),
    };

    let mut scheduler = Scheduler::new(jobs::standard_jobs(store, refresher, &cfg));
    scheduler.start();

    let app = axum::Router::new()
        .route("/v1/messages", post(forward))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("relay gateway listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The app (and its reporter handles) is gone once serve returns, so the
    // worker drains and exits.
    scheduler.stop().await;
    reporter.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    tracing::info!("shutdown signal received");
}

async fn handle_jobs_command(cfg: config::Config, cmd: cli::JobsCommands) -> anyhow::Result<()> {
    let pg = PgStore::connect(&cfg.database_url).await?;
    let store: Arc<dyn Store> = Arc::new(pg);
    let refresher = Arc::new(OauthRefresher::new(cfg.http_client_timeout())?);
    let scheduler = Scheduler::new(jobs::standard_jobs(store, refresher, &cfg));

    match cmd {
        cli::JobsCommands::List => {
            for name in scheduler.job_names() {
                println!("{name}");
            }
        }
        cli::JobsCommands::Run { name } => {
            let summary = scheduler.trigger(&name).await?;
            println!("{summary}");
        }
    }
    Ok(())
}
