use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

use common::config::Config;
use common::Context;
use server::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "funnel-server", about = "Servidor de tareas TES")]
struct Args {
    /// Fichero de configuración TOML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Puerto HTTP (sobrescribe server.http_port)
    #[arg(long)]
    http_port: Option<u16>,

    /// Diario de eventos (sobrescribe server.db_path)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut conf = Config::load(args.config.as_deref()).context("cargando configuración")?;
    if let Some(port) = args.http_port {
        conf.server.http_port = port;
    }
    if let Some(path) = args.db_path {
        conf.server.db_path = Some(path);
    }

    common::logging::init(
        &conf.logger,
        "funnel_server=debug,server=debug,tower_http=info,axum=info",
    );

    let addr = format!("0.0.0.0:{}", conf.server.http_port);
    let state = AppState::new(conf)?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo abrir {addr}"))?;

    let ctx = Context::background();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("señal recibida, apagando");
            signal_ctx.cancel();
        }
    });

    server::serve(state, listener, ctx).await
}
