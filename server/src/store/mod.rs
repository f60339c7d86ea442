mod journal;
mod memory;

pub use journal::Journal;
pub use memory::MemoryStore;

use async_trait::async_trait;
use common::api::{ListTasksRequest, ListTasksResponse};
use common::reducer::ReduceError;
use common::{Event, Node, NodeState, Task, View};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("version outdated: stored {stored}, got {got}")]
    VersionOutdated { stored: u64, got: u64 },
    #[error(transparent)]
    Reduce(#[from] ReduceError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Lado de lectura del store de tareas.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, id: &str, view: View) -> Result<Task, StoreError>;

    /// Ids en orden descendente; el token es el último id devuelto.
    async fn list_tasks(&self, req: &ListTasksRequest) -> Result<ListTasksResponse, StoreError>;

    /// Hasta `n` tareas en QUEUED, las más antiguas primero.
    async fn read_queue(&self, n: usize) -> Vec<Task>;
}

/// Registro de nodos con bloqueo optimista por `version`.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn get_node(&self, id: &str) -> Result<Node, StoreError>;

    async fn list_nodes(&self) -> Vec<Node>;

    /// Heartbeat de un nodo: fusiona campos, sube la versión y marca el ping.
    async fn update_node(&self, req: Node) -> Result<Node, StoreError>;

    /// Cambio de estado hecho por el servidor (scaler, reaper).
    async fn set_node_state(
        &self,
        id: &str,
        state: NodeState,
        expected_version: u64,
    ) -> Result<Node, StoreError>;

    async fn delete_node(&self, id: &str) -> Result<(), StoreError>;

    /// Pasa la tarea a INITIALIZING y la enlaza al nodo, todo o nada.
    /// Devuelve los eventos aplicados para reenviarlos al resto de writers.
    async fn assign_task(
        &self,
        task_id: &str,
        node_id: &str,
        expected_version: u64,
    ) -> Result<Vec<Event>, StoreError>;
}
