mod bus;
mod emitter;
mod filter;
mod retry;

pub use bus::{BusWriter, KafkaRestPublisher, Publisher, PubSubPublisher};
pub use emitter::{ExecutorEvents, TaskEvents};
pub use filter::SystemLogFilter;
pub use retry::{RetryPolicy, RetryWriter};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{Event, Payload};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Red, timeouts, 5xx: se puede reintentar.
    #[error("transient error: {0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Transient(_))
    }
}

/// Destino de eventos de tarea. Toda escritura pasa por aquí.
#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError>;

    async fn close(&self) {}
}

#[async_trait]
impl<W: EventWriter + ?Sized> EventWriter for Arc<W> {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        (**self).write_event(ev).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Reparte cada evento entre varios writers. Todos reciben el evento aunque
/// alguno falle; se devuelve el primer error.
#[derive(Default, Clone)]
pub struct MultiWriter {
    writers: Vec<Arc<dyn EventWriter>>,
}

impl MultiWriter {
    pub fn new(writers: Vec<Arc<dyn EventWriter>>) -> Self {
        MultiWriter { writers }
    }

    pub fn push(&mut self, w: Arc<dyn EventWriter>) {
        self.writers.push(w);
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

#[async_trait]
impl EventWriter for MultiWriter {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        let mut first = None;
        for w in &self.writers {
            if let Err(e) = w.write_event(ev).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn close(&self) {
        for w in &self.writers {
            w.close().await;
        }
    }
}

/// Vuelca los eventos como registros de tracing.
#[derive(Debug, Default, Clone)]
pub struct LogWriter;

#[async_trait]
impl EventWriter for LogWriter {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        let id = ev.id.as_str();
        match &ev.payload {
            Payload::Task(_) => info!(task_id = id, "tarea creada"),
            Payload::State(s) => info!(task_id = id, state = %s, "cambio de estado"),
            Payload::SystemLog(sl) => match sl.level.as_str() {
                "error" | "warn" => {
                    warn!(task_id = id, attempt = ev.attempt, index = ev.index, fields = ?sl.fields, "{}", sl.msg)
                }
                "debug" => {
                    debug!(task_id = id, attempt = ev.attempt, index = ev.index, fields = ?sl.fields, "{}", sl.msg)
                }
                _ => {
                    info!(task_id = id, attempt = ev.attempt, index = ev.index, fields = ?sl.fields, "{}", sl.msg)
                }
            },
            Payload::Stdout(chunk) | Payload::Stderr(chunk) => {
                debug!(task_id = id, index = ev.index, kind = %ev.kind, bytes = chunk.len(), "log de executor")
            }
            other => debug!(task_id = id, attempt = ev.attempt, index = ev.index, kind = %ev.kind, payload = ?other, "evento"),
        }
        Ok(())
    }
}

/// Descarta todo.
#[derive(Debug, Default, Clone)]
pub struct NoopWriter;

#[async_trait]
impl EventWriter for NoopWriter {
    async fn write_event(&self, _ev: &Event) -> Result<(), WriteError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Guarda los eventos recibidos; opcionalmente falla las primeras `fail` llamadas.
    #[derive(Default)]
    pub struct Recorder {
        pub events: Mutex<Vec<Event>>,
        pub fail: Mutex<Vec<WriteError>>,
    }

    #[async_trait]
    impl EventWriter for Recorder {
        async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
            if let Some(e) = self.fail.lock().unwrap().pop() {
                return Err(e);
            }
            self.events.lock().unwrap().push(ev.clone());
            Ok(())
        }
    }
}
