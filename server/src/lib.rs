//! Servidor TES: API HTTP, store de eventos, backends de cómputo y scheduler.

pub mod auth;
pub mod compute;
pub mod error;
pub mod handlers;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;
pub mod writers;

use anyhow::Context as _;
use common::config::ComputeKind;
use common::Context;
use tokio::net::TcpListener;
use tracing::info;

use crate::scheduler::{reaper, Scheduler};
use crate::state::AppState;

/// Arranca los loops de fondo y sirve HTTP hasta que se cancele `ctx`.
pub async fn serve(state: AppState, listener: TcpListener, ctx: Context) -> anyhow::Result<()> {
    if state.conf.compute == ComputeKind::Builtin {
        let sched = Scheduler::from_config(
            state.store.clone(),
            state.sinks.clone(),
            state.conf.scheduler.clone(),
        );
        let sched_ctx = ctx.clone();
        tokio::spawn(async move { sched.run(sched_ctx).await });

        let reaper_state = state.clone();
        let reaper_ctx = ctx.clone();
        tokio::spawn(async move { reaper::run_reaper(reaper_state, reaper_ctx).await });
    }

    let writer = state.writer.clone();
    let app = handlers::build_router(state);
    info!("servidor escuchando en {}", listener.local_addr()?);

    let shutdown = ctx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("servidor http")?;

    writer.close().await;
    info!("servidor detenido");
    Ok(())
}
