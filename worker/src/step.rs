//! Un executor: contenedor, cola de logs e inspección de puertos.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::events::fields;
use common::writer::ExecutorEvents;
use common::{Context, Level};

use crate::container::{ContainerRuntime, ContainerSpec, StepIo};
use crate::error::WorkerError;
use crate::tail::{self, Forwarder, Stream, TailConfig};

const OUTPUT_QUEUE: usize = 64;
const INSPECT_RETRIES: u32 = 5;
const INSPECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct Step {
    pub spec: ContainerSpec,
    /// Rutas del host ya mapeadas.
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

#[derive(Clone)]
pub struct StepRunner {
    runtime: Arc<dyn ContainerRuntime>,
    tail_size: usize,
    log_rate: Duration,
    inspect_delay: Duration,
}

impl StepRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, tail_size: usize, log_rate: Duration) -> Self {
        StepRunner {
            runtime,
            tail_size,
            log_rate,
            inspect_delay: Duration::from_secs(2),
        }
    }

    pub fn with_inspect_delay(mut self, d: Duration) -> Self {
        self.inspect_delay = d;
        self
    }

    /// Ejecuta el paso y devuelve el código de salida del contenedor.
    /// EXECUTOR_END_TIME se emite siempre; el código solo si el contenedor terminó.
    pub async fn run(
        &self,
        ctx: &Context,
        step: Step,
        exec: &ExecutorEvents,
    ) -> Result<i32, WorkerError> {
        exec.start_time().await;
        let ip = crate::util::external_ip().unwrap_or_default();
        exec.host_ip(&ip).await;

        let res = self.run_container(ctx, step, exec).await;
        exec.end_time().await;
        if let Ok(code) = res {
            exec.exit_code(code).await;
        }
        res
    }

    async fn run_container(
        &self,
        ctx: &Context,
        step: Step,
        exec: &ExecutorEvents,
    ) -> Result<i32, WorkerError> {
        let stdin = match &step.stdin {
            Some(p) => Some(tokio::fs::File::open(p).await.map_err(|e| {
                WorkerError::System(format!("opening stdin {}: {e}", p.display()))
            })?),
            None => None,
        };
        let stdout_file = create_log_file(step.stdout.as_deref()).await?;
        let stderr_file = create_log_file(step.stderr.as_deref()).await?;

        if let Err(e) = self.runtime.pull(&step.spec.image).await {
            // la imagen puede estar ya en local
            let err = e.to_string();
            exec.log(
                Level::Warn,
                "failed to pull image",
                fields([("image", step.spec.image.as_str()), ("error", err.as_str())]),
            )
            .await;
        }

        let forwarder = Forwarder::spawn(exec.writer());
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (err_tx, err_rx) = mpsc::channel(OUTPUT_QUEUE);
        let tails = [
            tokio::spawn(tail::tail(
                Stream::Stdout,
                out_rx,
                stdout_file,
                exec.clone(),
                forwarder.sender(),
                self.tail_config(),
            )),
            tokio::spawn(tail::tail(
                Stream::Stderr,
                err_rx,
                stderr_file,
                exec.clone(),
                forwarder.sender(),
                self.tail_config(),
            )),
        ];

        let step_ctx = ctx.child();
        let inspector = tokio::spawn(inspect(
            step_ctx.clone(),
            self.runtime.clone(),
            step.spec.name.clone(),
            exec.clone(),
            self.inspect_delay,
        ));

        let io = StepIo {
            stdin,
            stdout: out_tx,
            stderr: err_tx,
        };
        info!(container = %step.spec.name, image = %step.spec.image, "lanzando executor");
        let res = tokio::select! {
            r = self.runtime.run(&step.spec, io) => r.map_err(WorkerError::from),
            _ = ctx.cancelled() => {
                info!(container = %step.spec.name, "parando contenedor");
                if let Err(e) = self.runtime.stop(&step.spec.name).await {
                    warn!(container = %step.spec.name, "no se pudo parar el contenedor: {e}");
                }
                Err(WorkerError::Canceled)
            }
        };

        step_ctx.cancel();
        if let Err(e) = inspector.await {
            debug!("inspector de puertos: {e}");
        }
        for t in tails {
            if let Err(e) = t.await {
                warn!("cola de logs terminó mal: {e}");
            }
        }
        forwarder.close().await;
        res
    }

    fn tail_config(&self) -> TailConfig {
        TailConfig {
            size: self.tail_size,
            rate: self.log_rate,
        }
    }
}

async fn create_log_file(
    path: Option<&Path>,
) -> Result<Option<(PathBuf, tokio::fs::File)>, WorkerError> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let f = tokio::fs::File::create(path).await.map_err(|e| {
        WorkerError::System(format!("couldn't prepare log file {}: {e}", path.display()))
    })?;
    Ok(Some((path.to_path_buf(), f)))
}

/// Tras `delay`, pregunta por los puertos publicados hasta que el runtime responde.
async fn inspect(
    ctx: Context,
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    exec: ExecutorEvents,
    delay: Duration,
) {
    tokio::select! {
        _ = ctx.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    for attempt in 0..INSPECT_RETRIES {
        if attempt > 0 {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(INSPECT_INTERVAL) => {}
            }
        }
        let res = tokio::select! {
            _ = ctx.cancelled() => return,
            r = runtime.inspect_ports(&name) => r,
        };
        match res {
            Ok(ports) => {
                if !ports.is_empty() {
                    exec.ports(ports).await;
                }
                return;
            }
            Err(e) => debug!(container = %name, attempt, "inspección fallida: {e}"),
        }
    }
}
