//! Backends de cómputo: a dónde se despacha una tarea recién creada.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use common::config::HpcConfig;
use common::events::fields;
use common::writer::{EventWriter, TaskEvents};
use common::{State, Task};

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("submit failed: {0}")]
    Submit(String),
    #[error("cancel failed: {0}")]
    Cancel(String),
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Se llama justo después de TASK_CREATED.
    async fn submit(&self, task: &Task) -> Result<(), ComputeError>;

    /// Se llama después de escribir CANCELED.
    async fn cancel(&self, task_id: &str) -> Result<(), ComputeError>;
}

/// Planificador de nodos propio: las tareas se quedan en la cola y el
/// scheduler las reparte, los nodos ven la cancelación al sondear.
#[derive(Debug, Default)]
pub struct Builtin;

#[async_trait]
impl ComputeBackend for Builtin {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn submit(&self, _task: &Task) -> Result<(), ComputeError> {
        Ok(())
    }

    async fn cancel(&self, _task_id: &str) -> Result<(), ComputeError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Noop;

#[async_trait]
impl ComputeBackend for Noop {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn submit(&self, _task: &Task) -> Result<(), ComputeError> {
        Ok(())
    }

    async fn cancel(&self, _task_id: &str) -> Result<(), ComputeError> {
        Ok(())
    }
}

/* ---------------- HPC (slurm, pbs, htcondor...) ---------------- */

/// Envía cada tarea con un comando de plantilla (`sbatch`, `qsub`...).
/// Si el envío falla la tarea pasa a SYSTEM_ERROR con el stderr del comando.
pub struct Hpc {
    conf: HpcConfig,
    writer: Arc<dyn EventWriter>,
}

impl Hpc {
    pub fn new(conf: HpcConfig, writer: Arc<dyn EventWriter>) -> Self {
        Hpc { conf, writer }
    }

    fn render_submit(&self, task: &Task) -> String {
        let res = task.requested();
        let worker_cmd = self.conf.worker_command.replace("{{task_id}}", &task.id);
        self.conf
            .submit_template
            .replace("{{task_id}}", &task.id)
            .replace("{{cpus}}", &res.cpu_cores.to_string())
            .replace("{{ram_gb}}", &res.ram_gb.to_string())
            .replace("{{disk_gb}}", &res.disk_gb.to_string())
            .replace("{{worker_cmd}}", &worker_cmd)
    }
}

/// Ejecuta `sh -c script`; Err con stderr (o el error de spawn) si no sale con 0.
pub(crate) async fn run_script(script: &str) -> Result<String, String> {
    let out = Command::new("sh")
        .arg("-c")
        .arg(script)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if out.status.success() {
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_owned())
    } else {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_owned();
        Err(if stderr.is_empty() {
            format!("exit status {}", out.status)
        } else {
            stderr
        })
    }
}

#[async_trait]
impl ComputeBackend for Hpc {
    fn name(&self) -> &'static str {
        "hpc"
    }

    async fn submit(&self, task: &Task) -> Result<(), ComputeError> {
        if self.conf.submit_template.is_empty() {
            return Err(ComputeError::Submit("hpc submit template is empty".into()));
        }
        let script = self.render_submit(task);
        let events = TaskEvents::new(task.id.clone(), 0, self.writer.clone());

        match run_script(&script).await {
            Ok(stdout) => {
                info!(task_id = %task.id, "tarea enviada al gestor hpc: {stdout}");
                if !stdout.is_empty() {
                    events.metadata(fields([("hpc_submit_output", stdout)])).await;
                }
            }
            Err(stderr) => {
                warn!(task_id = %task.id, "fallo al enviar al gestor hpc: {stderr}");
                events
                    .error("hpc submit failed", fields([("stderr", stderr)]))
                    .await;
                events.state(State::SystemError).await;
            }
        }
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ComputeError> {
        if self.conf.cancel_template.is_empty() {
            return Ok(());
        }
        let script = self.conf.cancel_template.replace("{{task_id}}", task_id);
        run_script(&script).await.map(|_| ()).map_err(ComputeError::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TaskStore};
    use common::{Event, Executor, Resources, View};

    fn task() -> Task {
        Task {
            id: "t1".into(),
            executors: vec![Executor {
                image: "alpine".into(),
                command: vec!["true".into()],
                ..Default::default()
            }],
            resources: Some(Resources {
                cpu_cores: 4,
                ram_gb: 2.5,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn submit_template_placeholders() {
        let hpc = Hpc::new(
            HpcConfig {
                submit_template: "sbatch -c {{cpus}} --mem={{ram_gb}}G --wrap '{{worker_cmd}}'".into(),
                ..Default::default()
            },
            Arc::new(MemoryStore::new(10)),
        );
        assert_eq!(
            hpc.render_submit(&task()),
            "sbatch -c 4 --mem=2.5G --wrap 'funnel-worker run --task-id t1'"
        );
    }

    #[tokio::test]
    async fn rejected_submit_is_a_system_error() {
        let store = Arc::new(MemoryStore::new(100));
        store.write_event(&Event::created(task())).await.unwrap();
        let hpc = Hpc::new(
            HpcConfig {
                submit_template: "echo 'too many cpus' >&2; exit 1".into(),
                ..Default::default()
            },
            store.clone(),
        );
        hpc.submit(&task()).await.unwrap();

        let t = store.get_task("t1", View::Full).await.unwrap();
        assert_eq!(t.state, State::SystemError);
        assert!(t.logs[0].system_logs[0].contains("too many cpus"));
    }
}
