//! Runtime de contenedores. La implementación por defecto invoca la CLI
//! de docker (o un driver compatible) con `tokio::process`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::mapper::Volume;
use common::Ports;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container driver is empty")]
    NoDriver,
    #[error("spawning {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{cmd} failed: {stderr}")]
    Failed { cmd: String, stderr: String },
    #[error("container {0} was killed by a signal")]
    Killed(String),
    #[error("container io: {0}")]
    Io(#[from] std::io::Error),
}

/// Lo necesario para lanzar un executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<Volume>,
    pub workdir: String,
    pub ports: Vec<Ports>,
    pub remove: bool,
}

/// Entrada y salidas del proceso. Las salidas llegan troceadas por canal;
/// cuando el runtime suelta los emisores se entiende que terminaron.
pub struct StepIo {
    pub stdin: Option<tokio::fs::File>,
    pub stdout: mpsc::Sender<Vec<u8>>,
    pub stderr: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), ContainerError>;

    /// Ejecuta hasta el final y devuelve el código de salida.
    async fn run(&self, spec: &ContainerSpec, io: StepIo) -> Result<i32, ContainerError>;

    async fn stop(&self, name: &str) -> Result<(), ContainerError>;

    /// Puertos publicados del contenedor en marcha.
    async fn inspect_ports(&self, name: &str) -> Result<Vec<Ports>, ContainerError>;
}

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    driver: Vec<String>,
}

impl DockerRuntime {
    /// `driver` es el comando base, p.ej. `["docker"]` o `["sudo", "docker"]`.
    pub fn new(driver: Vec<String>) -> Result<Self, ContainerError> {
        if driver.first().map_or(true, |d| d.is_empty()) {
            return Err(ContainerError::NoDriver);
        }
        Ok(DockerRuntime { driver })
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.driver[0]);
        cmd.args(&self.driver[1..]).args(args).kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[String]) -> String {
        self.driver.iter().chain(args).cloned().collect::<Vec<_>>().join(" ")
    }

    /// Ejecuta un comando corto y devuelve su stdout.
    async fn output(&self, args: Vec<String>) -> Result<String, ContainerError> {
        let cmd = self.describe(&args);
        let out = self
            .command(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ContainerError::Spawn { cmd: cmd.clone(), source })?;
        if !out.status.success() {
            return Err(ContainerError::Failed {
                cmd,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Argumentos de `docker run` para un executor.
pub fn run_args(spec: &ContainerSpec, interactive: bool) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    if interactive {
        args.push("-i".into());
    }
    if spec.remove {
        args.push("--rm".into());
    }
    args.extend(["--name".into(), spec.name.clone()]);
    for (k, v) in &spec.env {
        args.extend(["-e".into(), format!("{k}={v}")]);
    }
    for p in &spec.ports {
        let publish = if p.host == 0 {
            p.container.to_string()
        } else {
            format!("{}:{}", p.host, p.container)
        };
        args.extend(["-p".into(), publish]);
    }
    if !spec.workdir.is_empty() {
        args.extend(["-w".into(), spec.workdir.clone()]);
    }
    for v in &spec.volumes {
        let mode = if v.readonly { "ro" } else { "rw" };
        args.extend([
            "-v".into(),
            format!("{}:{}:{}", v.host_path.display(), v.container_path, mode),
        ]);
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

async fn forward<R: AsyncRead + Unpin>(mut r: R, tx: mpsc::Sender<Vec<u8>>) -> std::io::Result<()> {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        // receptor cerrado: se sigue leyendo para no bloquear al proceso
        let _ = tx.send(buf[..n].to_vec()).await;
    }
}

#[derive(Deserialize)]
struct Binding {
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

/// Parsea `{{json .NetworkSettings.Ports}}`: `{"80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32768"}]}`.
pub fn parse_ports(raw: &str) -> Vec<Ports> {
    let Ok(map) = serde_json::from_str::<BTreeMap<String, Option<Vec<Binding>>>>(raw.trim()) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (key, bindings) in map {
        let Some(container) = key.split('/').next().and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        for b in bindings.unwrap_or_default() {
            if let Ok(host) = b.host_port.parse::<u32>() {
                let p = Ports { container, host };
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        }
    }
    out
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<(), ContainerError> {
        self.output(vec!["pull".into(), image.to_string()]).await.map(|_| ())
    }

    async fn run(&self, spec: &ContainerSpec, io: StepIo) -> Result<i32, ContainerError> {
        let args = run_args(spec, io.stdin.is_some());
        let cmd = self.describe(&args);
        debug!(container = %spec.name, "{cmd}");

        let mut child = self
            .command(&args)
            .stdin(if io.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ContainerError::Spawn { cmd, source })?;

        let feed = {
            let pipe = child.stdin.take();
            let file = io.stdin;
            async move {
                if let (Some(mut pipe), Some(mut file)) = (pipe, file) {
                    tokio::io::copy(&mut file, &mut pipe).await?;
                    pipe.shutdown().await?;
                }
                Ok::<_, std::io::Error>(())
            }
        };
        let out = child.stdout.take();
        let err = child.stderr.take();
        let pump_out = async move {
            match out {
                Some(r) => forward(r, io.stdout).await,
                None => Ok(()),
            }
        };
        let pump_err = async move {
            match err {
                Some(r) => forward(r, io.stderr).await,
                None => Ok(()),
            }
        };

        let (fed, o, e, status) = tokio::join!(feed, pump_out, pump_err, child.wait());
        if let Err(e) = fed {
            // el proceso puede cerrar stdin antes de leerlo todo
            debug!(container = %spec.name, "stdin: {e}");
        }
        o?;
        e?;
        status?
            .code()
            .ok_or_else(|| ContainerError::Killed(spec.name.clone()))
    }

    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        self.output(vec!["rm".into(), "-f".into(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn inspect_ports(&self, name: &str) -> Result<Vec<Ports>, ContainerError> {
        let raw = self
            .output(vec![
                "inspect".into(),
                "--format".into(),
                "{{json .NetworkSettings.Ports}}".into(),
                name.to_string(),
            ])
            .await?;
        Ok(parse_ports(&raw))
    }
}
