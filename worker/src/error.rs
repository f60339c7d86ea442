use thiserror::Error;

use crate::container::ContainerError;
use crate::mapper::MapError;
use crate::storage::StorageError;
use common::State;

/// Motivo por el que termina una ejecución que no acaba en COMPLETE.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Fallo de infraestructura: mapeo, transferencias, runtime.
    #[error("system error: {0}")]
    System(String),
    #[error("executor {index} exited with code {code}")]
    Executor { index: usize, code: i32 },
    #[error("task canceled")]
    Canceled,
}

impl WorkerError {
    /// Estado final de la tarea para este error.
    pub fn state(&self) -> State {
        match self {
            WorkerError::System(_) => State::SystemError,
            WorkerError::Executor { .. } => State::ExecutorError,
            WorkerError::Canceled => State::Canceled,
        }
    }
}

impl From<MapError> for WorkerError {
    fn from(e: MapError) -> Self {
        WorkerError::System(e.to_string())
    }
}

impl From<StorageError> for WorkerError {
    fn from(e: StorageError) -> Self {
        WorkerError::System(e.to_string())
    }
}

impl From<ContainerError> for WorkerError {
    fn from(e: ContainerError) -> Self {
        WorkerError::System(e.to_string())
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        WorkerError::System(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_final_state() {
        assert_eq!(WorkerError::System("x".into()).state(), State::SystemError);
        assert_eq!(WorkerError::Executor { index: 0, code: 1 }.state(), State::ExecutorError);
        assert_eq!(WorkerError::Canceled.state(), State::Canceled);
        let e: WorkerError = MapError::Escape("../x".into()).into();
        assert!(matches!(e, WorkerError::System(m) if m.contains("escapes")));
    }
}
