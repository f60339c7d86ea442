use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use super::EventWriter;
use crate::events::{Event, Level};
use crate::task::{OutputFileLog, Ports, State};

/// Emisor de eventos ligado a una tarea e intento.
///
/// Un fallo de escritura se registra y se ignora: perder un evento de log
/// nunca aborta la tarea.
#[derive(Clone)]
pub struct TaskEvents {
    id: String,
    attempt: u32,
    out: Arc<dyn EventWriter>,
}

impl TaskEvents {
    pub fn new(id: impl Into<String>, attempt: u32, out: Arc<dyn EventWriter>) -> Self {
        TaskEvents {
            id: id.into(),
            attempt,
            out,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn writer(&self) -> Arc<dyn EventWriter> {
        self.out.clone()
    }

    pub async fn emit(&self, ev: Event) {
        if let Err(e) = self.out.write_event(&ev).await {
            warn!(task_id = %self.id, kind = %ev.kind, "no se pudo escribir el evento: {e}");
        }
    }

    pub async fn state(&self, s: State) {
        self.emit(Event::state(&self.id, s).scoped(self.attempt, 0)).await
    }

    pub async fn start_time(&self) {
        self.emit(Event::start_time(&self.id, self.attempt, Utc::now())).await
    }

    pub async fn end_time(&self) {
        self.emit(Event::end_time(&self.id, self.attempt, Utc::now())).await
    }

    pub async fn outputs(&self, value: Vec<OutputFileLog>) {
        self.emit(Event::outputs(&self.id, self.attempt, value)).await
    }

    pub async fn metadata(&self, value: BTreeMap<String, String>) {
        self.emit(Event::metadata(&self.id, self.attempt, value)).await
    }

    pub async fn log(&self, level: Level, msg: &str, fields: BTreeMap<String, String>) {
        self.emit(Event::system_log(&self.id, self.attempt, 0, level, msg, fields))
            .await
    }

    pub async fn info(&self, msg: &str, fields: BTreeMap<String, String>) {
        self.log(Level::Info, msg, fields).await
    }

    pub async fn warn(&self, msg: &str, fields: BTreeMap<String, String>) {
        self.log(Level::Warn, msg, fields).await
    }

    pub async fn error(&self, msg: &str, fields: BTreeMap<String, String>) {
        self.log(Level::Error, msg, fields).await
    }

    pub fn executor(&self, index: u32) -> ExecutorEvents {
        ExecutorEvents {
            task: self.clone(),
            index,
        }
    }
}

/// Igual que [`TaskEvents`] pero con ámbito de un executor.
#[derive(Clone)]
pub struct ExecutorEvents {
    task: TaskEvents,
    index: u32,
}

impl ExecutorEvents {
    pub fn index(&self) -> u32 {
        self.index
    }

    fn ids(&self) -> (&str, u32, u32) {
        (&self.task.id, self.task.attempt, self.index)
    }

    pub async fn start_time(&self) {
        let (id, a, i) = self.ids();
        self.task.emit(Event::executor_start_time(id, a, i, Utc::now())).await
    }

    pub async fn end_time(&self) {
        let (id, a, i) = self.ids();
        self.task.emit(Event::executor_end_time(id, a, i, Utc::now())).await
    }

    pub async fn exit_code(&self, code: i32) {
        let (id, a, i) = self.ids();
        self.task.emit(Event::exit_code(id, a, i, code)).await
    }

    pub async fn host_ip(&self, ip: &str) {
        let (id, a, i) = self.ids();
        self.task.emit(Event::host_ip(id, a, i, ip)).await
    }

    pub async fn ports(&self, value: Vec<Ports>) {
        let (id, a, i) = self.ids();
        self.task.emit(Event::ports(id, a, i, value)).await
    }

    pub fn stdout_event(&self, chunk: String) -> Event {
        let (id, a, i) = self.ids();
        Event::stdout(id, a, i, chunk)
    }

    pub fn stderr_event(&self, chunk: String) -> Event {
        let (id, a, i) = self.ids();
        Event::stderr(id, a, i, chunk)
    }

    pub async fn log(&self, level: Level, msg: &str, fields: BTreeMap<String, String>) {
        let (id, a, i) = self.ids();
        self.task
            .emit(Event::system_log(id, a, i, level, msg, fields))
            .await
    }

    pub fn writer(&self) -> Arc<dyn EventWriter> {
        self.task.writer()
    }
}
