//! Motor del worker: ejecuta una tarea de principio a fin.
//!
//! Pasos: mapear ficheros, validar URLs, descargar entradas, RUNNING,
//! executors en orden, subir salidas y estado final. Los eventos salen
//! siempre en ese orden; el estado final lo decide [`WorkerError::state`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use common::config::WorkerConfig;
use common::events::fields;
use common::writer::{EventWriter, TaskEvents};
use common::{Context, State, Task};

use crate::container::{ContainerRuntime, ContainerSpec};
use crate::error::WorkerError;
use crate::mapper::FileMapper;
use crate::reader::{ReadError, TaskReader};
use crate::step::{Step, StepRunner};
use crate::storage::Storage;
use crate::transfer;
use crate::util;

pub struct Engine {
    conf: WorkerConfig,
    storage: Arc<dyn Storage>,
    steps: StepRunner,
    writer: Arc<dyn EventWriter>,
}

impl Engine {
    pub fn new(
        conf: WorkerConfig,
        storage: Arc<dyn Storage>,
        runtime: Arc<dyn ContainerRuntime>,
        writer: Arc<dyn EventWriter>,
    ) -> Self {
        let steps = StepRunner::new(runtime, conf.log_tail_size, conf.log_update_rate());
        Engine {
            conf,
            storage,
            steps,
            writer,
        }
    }

    pub fn with_inspect_delay(mut self, d: Duration) -> Self {
        self.steps = self.steps.with_inspect_delay(d);
        self
    }

    /// Ejecuta la tarea que entrega `reader` y devuelve su estado final.
    /// Solo falla si no se pudo leer la tarea.
    pub async fn run(&self, ctx: &Context, reader: Arc<dyn TaskReader>) -> Result<State, ReadError> {
        let task = reader.task().await.map_err(|e| {
            error!("no se pudo obtener la tarea: {e}");
            e
        })?;
        let events = TaskEvents::new(task.id.clone(), 0, self.writer.clone());
        info!(task_id = %task.id, "ejecutando tarea");

        events
            .info("worker started", fields([("version", env!("CARGO_PKG_VERSION"))]))
            .await;
        events.state(State::Initializing).await;
        if let Ok(name) = hostname::get() {
            events
                .metadata(fields([("hostname", name.to_string_lossy())]))
                .await;
        }

        let task_ctx = ctx.child();
        let canceled = Arc::new(AtomicBool::new(false));
        let poll_ctx = task_ctx.child();
        let poller = tokio::spawn(poll_for_cancel(
            poll_ctx.clone(),
            task_ctx.clone(),
            reader.clone(),
            self.conf.polling_rate(),
            canceled.clone(),
        ));

        let work_dir = self.conf.work_dir.join(&task.id);
        let (mapper, res) = match FileMapper::new(&work_dir) {
            Ok(mut m) => {
                let res = self.execute(&task_ctx, &task, &mut m, &events).await;
                (Some(m), res)
            }
            Err(e) => (None, Err(WorkerError::from(e))),
        };

        poll_ctx.cancel();
        if let Err(e) = poller.await {
            debug!("poller de cancelación: {e}");
        }

        events.end_time().await;
        let state = if canceled.load(Ordering::SeqCst) || task_ctx.is_cancelled() {
            events.info("canceled", Default::default()).await;
            State::Canceled
        } else {
            match &res {
                Ok(()) => State::Complete,
                Err(e @ WorkerError::System(_)) => {
                    events.error("system error", fields([("error", e.to_string())])).await;
                    e.state()
                }
                Err(e @ WorkerError::Executor { .. }) => {
                    events.error("exec error", fields([("error", e.to_string())])).await;
                    e.state()
                }
                Err(WorkerError::Canceled) => State::Canceled,
            }
        };
        events.state(state).await;
        info!(task_id = %task.id, %state, "tarea terminada");

        if let Some(m) = mapper {
            if !self.conf.leave_work_dir {
                if let Err(e) = m.cleanup().await {
                    debug!(task_id = %task.id, "no se pudo limpiar el directorio: {e}");
                }
            }
        }
        Ok(state)
    }

    async fn execute(
        &self,
        ctx: &Context,
        task: &Task,
        mapper: &mut FileMapper,
        events: &TaskEvents,
    ) -> Result<(), WorkerError> {
        if ctx.is_cancelled() {
            return Err(WorkerError::Canceled);
        }
        mapper.map_task(task)?;
        transfer::validate(self.storage.as_ref(), &mapper.inputs, &mapper.outputs)?;
        transfer::download_inputs(
            ctx,
            &mapper.inputs,
            self.storage.clone(),
            events,
            self.conf.max_parallel_transfers,
        )
        .await?;

        events.state(State::Running).await;
        events.start_time().await;

        for (i, ex) in task.executors.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(WorkerError::Canceled);
            }
            let host = |p: &str| -> Result<Option<std::path::PathBuf>, WorkerError> {
                if p.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(mapper.host_path(p)?))
                }
            };
            let step = Step {
                spec: ContainerSpec {
                    name: format!("{}-{}", task.id, i),
                    image: ex.image.clone(),
                    command: ex.command.clone(),
                    env: ex.env.clone(),
                    volumes: mapper.volumes.clone(),
                    workdir: ex.workdir.clone(),
                    ports: ex.ports.clone(),
                    remove: true,
                },
                stdin: host(&ex.stdin)?,
                stdout: host(&ex.stdout)?,
                stderr: host(&ex.stderr)?,
            };
            let code = self.steps.run(ctx, step, &events.executor(i as u32)).await?;
            if code != 0 {
                if !ex.ignore_error {
                    return Err(WorkerError::Executor { index: i, code });
                }
                events
                    .warn(
                        "executor failed, ignoring",
                        fields([("index", i.to_string()), ("exit_code", code.to_string())]),
                    )
                    .await;
            }
        }

        for output in &mapper.outputs {
            util::fix_links(mapper, &output.path);
        }
        let (mut logs, res) = transfer::upload_outputs(
            ctx,
            &mapper.outputs,
            self.storage.clone(),
            events,
            self.conf.max_parallel_transfers,
        )
        .await;
        for log in &mut logs {
            log.path = mapper.container_path(Path::new(&log.path));
        }
        if !logs.is_empty() {
            events.outputs(logs).await;
        }
        res
    }
}

/// Cada `rate` consulta el estado de la tarea; si ya es terminal (la
/// cancelaron o el servidor la dio por perdida) cancela `task_ctx`.
async fn poll_for_cancel(
    poll_ctx: Context,
    task_ctx: Context,
    reader: Arc<dyn TaskReader>,
    rate: Duration,
    canceled: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = poll_ctx.cancelled() => return,
            _ = tokio::time::sleep(rate) => {}
        }
        match reader.state().await {
            Ok(s) if s.is_terminal() => {
                info!(state = %s, "tarea terminada desde fuera, cancelando");
                canceled.store(true, Ordering::SeqCst);
                task_ctx.cancel();
                return;
            }
            Ok(_) => {}
            Err(e) => debug!("no se pudo consultar el estado: {e}"),
        }
    }
}
