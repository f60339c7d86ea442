use anyhow::Context as _;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use common::client::Client;
use common::config::Config;
use common::writer::{EventWriter, LogWriter};
use common::{Context, State};
use worker::container::DockerRuntime;
use worker::engine::Engine;
use worker::node::NodeAgent;
use worker::reader::{RpcTaskReader, StaticTaskReader, TaskReader};
use worker::storage::Mux;

#[derive(Parser, Debug)]
#[command(name = "funnel-worker", about = "Worker y nodo TES")]
struct Args {
    /// Fichero de configuración TOML
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Dirección del servidor (sobrescribe rpc_client.server_address)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Heartbeat contra el servidor y ejecución de las tareas asignadas
    Node,
    /// Ejecuta una sola tarea
    Run(RunArgs),
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct RunArgs {
    /// Tarea guardada en el servidor
    #[arg(long)]
    task_id: Option<String>,

    /// Tarea en JSON en un fichero
    #[arg(long)]
    task_file: Option<PathBuf>,

    /// Tarea en JSON codificada en base64
    #[arg(long)]
    task_b64: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(State::SystemError) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<State> {
    let args = Args::parse();
    let mut conf = Config::load(args.config.as_deref()).context("cargando configuración")?;
    if let Some(server) = &args.server {
        conf.rpc_client.server_address = server.clone();
    }
    common::logging::init(&conf.logger, "funnel_worker=debug,worker=debug,reqwest=info");

    let ctx = Context::background();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("señal recibida, cancelando");
            signal_ctx.cancel();
        }
    });

    let runtime = Arc::new(
        DockerRuntime::new(conf.worker.container_driver.clone()).context("driver de contenedores")?,
    );
    let storage = Arc::new(Mux::from_config(&conf).context("configurando almacenamiento")?);
    let client = Client::new(&conf.rpc_client).context("cliente del servidor")?;

    match args.cmd {
        Command::Node => {
            let writer = worker::build_writer(&conf, client.clone());
            let engine = Engine::new(conf.worker.clone(), storage, runtime, writer);
            let agent = NodeAgent::new(conf, client, Arc::new(engine));
            agent.run(&ctx).await;
            Ok(State::Complete)
        }
        Command::Run(run) => {
            let (reader, writer): (Arc<dyn TaskReader>, Arc<dyn EventWriter>) =
                if let Some(id) = run.task_id {
                    (
                        Arc::new(RpcTaskReader::new(client.clone(), id)),
                        worker::build_writer(&conf, client),
                    )
                } else {
                    let reader = match (run.task_file, run.task_b64) {
                        (Some(path), _) => StaticTaskReader::from_file(&path)
                            .await
                            .with_context(|| format!("leyendo {}", path.display()))?,
                        (None, Some(data)) => {
                            StaticTaskReader::from_base64(&data).context("decodificando la tarea")?
                        }
                        (None, None) => anyhow::bail!("falta --task-id, --task-file o --task-b64"),
                    };
                    // sin --server los eventos solo van al log
                    let writer = if args.server.is_some() {
                        worker::build_writer(&conf, client)
                    } else {
                        Arc::new(LogWriter)
                    };
                    (Arc::new(reader), writer)
                };

            let engine = Engine::new(conf.worker.clone(), storage, runtime, writer.clone());
            let state = engine.run(&ctx, reader).await?;
            writer.close().await;
            info!(%state, "tarea terminada");
            Ok(state)
        }
    }
}
