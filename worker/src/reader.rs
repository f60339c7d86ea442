//! Origen de la tarea que ejecuta el worker.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;
use thiserror::Error;

use common::client::{Client, ClientError};
use common::ids::IdGenerator;
use common::{State, Task, View};

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("reading task file: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding task: {0}")]
    Decode(String),
}

#[async_trait]
pub trait TaskReader: Send + Sync {
    async fn task(&self) -> Result<Task, ReadError>;

    /// Estado actual; el worker lo consulta para detectar cancelaciones.
    async fn state(&self) -> Result<State, ReadError>;
}

/// Lee la tarea del servidor.
pub struct RpcTaskReader {
    client: Client,
    id: String,
}

impl RpcTaskReader {
    pub fn new(client: Client, id: impl Into<String>) -> Self {
        RpcTaskReader {
            client,
            id: id.into(),
        }
    }
}

#[async_trait]
impl TaskReader for RpcTaskReader {
    async fn task(&self) -> Result<Task, ReadError> {
        Ok(self.client.get_task(&self.id, View::Full).await?)
    }

    async fn state(&self) -> Result<State, ReadError> {
        Ok(self.client.get_task(&self.id, View::Minimal).await?.state)
    }
}

/// Tarea fija, leída de un fichero JSON o de base64. Sin servidor no
/// hay cancelaciones que observar.
#[derive(Debug, Clone)]
pub struct StaticTaskReader {
    task: Task,
}

impl StaticTaskReader {
    pub fn new(mut task: Task) -> Self {
        if task.id.is_empty() {
            task.id = IdGenerator::new().next_id();
        }
        StaticTaskReader { task }
    }

    pub async fn from_file(path: &Path) -> Result<Self, ReadError> {
        let raw = tokio::fs::read(path).await?;
        let task = serde_json::from_slice(&raw).map_err(|e| ReadError::Decode(e.to_string()))?;
        Ok(Self::new(task))
    }

    pub fn from_base64(data: &str) -> Result<Self, ReadError> {
        let raw = STANDARD
            .decode(data.trim())
            .map_err(|e| ReadError::Decode(e.to_string()))?;
        let task = serde_json::from_slice(&raw).map_err(|e| ReadError::Decode(e.to_string()))?;
        Ok(Self::new(task))
    }
}

#[async_trait]
impl TaskReader for StaticTaskReader {
    async fn task(&self) -> Result<Task, ReadError> {
        Ok(self.task.clone())
    }

    async fn state(&self) -> Result<State, ReadError> {
        Ok(self.task.state)
    }
}
