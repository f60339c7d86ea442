#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

use common::config::WorkerConfig;
use common::writer::{EventWriter, WriteError};
use common::{reducer, Event, Ports, Task};
use worker::container::{ContainerError, ContainerRuntime, ContainerSpec, StepIo};

/// Runtime de mentira: interpreta `command` en vez de lanzar un contenedor.
///
/// - `echo a b`: escribe "a b\n" en stdout
/// - `fail N`: sale con código N
/// - `sleep MS`: duerme
/// - `write PATH TEXT`: crea PATH (ruta del contenedor) con TEXT
/// - `cat [PATH]`: copia PATH, o stdin si no hay PATH, a stdout
#[derive(Default)]
pub struct ScriptRuntime {
    pub runs: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
}

impl ScriptRuntime {
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

/// Traduce una ruta del contenedor con los volúmenes montados.
fn resolve(spec: &ContainerSpec, path: &str) -> PathBuf {
    spec.volumes
        .iter()
        .filter(|v| path == v.container_path || path.starts_with(&format!("{}/", v.container_path)))
        .max_by_key(|v| v.container_path.len())
        .map(|v| {
            let rest = path[v.container_path.len()..].trim_start_matches('/');
            if rest.is_empty() {
                v.host_path.clone()
            } else {
                v.host_path.join(rest)
            }
        })
        .unwrap_or_else(|| panic!("{path} is not mounted"))
}

#[async_trait]
impl ContainerRuntime for ScriptRuntime {
    async fn pull(&self, _image: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec, mut io: StepIo) -> Result<i32, ContainerError> {
        self.runs.lock().unwrap().push(spec.name.clone());
        let args: Vec<&str> = spec.command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["echo", rest @ ..] => {
                let _ = io.stdout.send(format!("{}\n", rest.join(" ")).into_bytes()).await;
                Ok(0)
            }
            ["fail", code] => {
                let _ = io.stderr.send(b"boom\n".to_vec()).await;
                Ok(code.parse().unwrap())
            }
            ["sleep", ms] => {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
                Ok(0)
            }
            ["write", path, text] => {
                let host = resolve(spec, path);
                tokio::fs::create_dir_all(host.parent().unwrap()).await?;
                tokio::fs::write(host, text).await?;
                Ok(0)
            }
            ["cat", path] => {
                let data = tokio::fs::read(resolve(spec, path)).await?;
                let _ = io.stdout.send(data).await;
                Ok(0)
            }
            ["cat"] => {
                let mut data = Vec::new();
                if let Some(f) = io.stdin.as_mut() {
                    f.read_to_end(&mut data).await?;
                }
                let _ = io.stdout.send(data).await;
                Ok(0)
            }
            other => panic!("unknown script {other:?}"),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        self.stopped.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn inspect_ports(&self, _name: &str) -> Result<Vec<Ports>, ContainerError> {
        Ok(vec![])
    }
}

#[derive(Default)]
pub struct Recorder(pub Mutex<Vec<Event>>);

#[async_trait]
impl EventWriter for Recorder {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        self.0.lock().unwrap().push(ev.clone());
        Ok(())
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Reconstruye la tarea como la vería el servidor.
    pub fn fold(&self, task: &Task) -> Task {
        let mut all = vec![Event::created(task.clone())];
        all.extend(self.events());
        reducer::fold(&all, 10_000)
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.payload {
                common::Payload::SystemLog(sl) => Some(sl.msg),
                _ => None,
            })
            .collect()
    }
}

pub fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("funnel-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn worker_conf(work_dir: &Path) -> WorkerConfig {
    WorkerConfig {
        work_dir: work_dir.to_path_buf(),
        polling_rate_ms: 50,
        log_update_rate_ms: 20,
        ..Default::default()
    }
}

pub fn runtime() -> Arc<ScriptRuntime> {
    Arc::new(ScriptRuntime::default())
}
