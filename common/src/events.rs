use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::task::{OutputFileLog, Ports, State, Task};

/// Formato canónico de tiempo: RFC3339 con nanosegundos, en UTC.
pub fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskCreated,
    TaskState,
    TaskStartTime,
    TaskEndTime,
    TaskOutputs,
    TaskMetadata,
    ExecutorStartTime,
    ExecutorEndTime,
    ExecutorExitCode,
    ExecutorHostIp,
    ExecutorPorts,
    ExecutorStdout,
    ExecutorStderr,
    SystemLog,
}

impl EventType {
    /// Eventos con ámbito de executor (usan `index`).
    pub fn is_executor_scoped(self) -> bool {
        matches!(
            self,
            EventType::ExecutorStartTime
                | EventType::ExecutorEndTime
                | EventType::ExecutorExitCode
                | EventType::ExecutorHostIp
                | EventType::ExecutorPorts
                | EventType::ExecutorStdout
                | EventType::ExecutorStderr
        )
    }

    /// Eventos de log voluminosos que los buses de mensajes omiten.
    pub fn is_log(self) -> bool {
        matches!(
            self,
            EventType::ExecutorStdout | EventType::ExecutorStderr | EventType::SystemLog
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Outputs {
    pub value: Vec<OutputFileLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub value: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortBindings {
    pub value: Vec<Ports>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemLog {
    pub level: String,
    pub msg: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// Brazo del payload. La clave JSON del brazo acompaña al `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    Task(Box<Task>),
    State(State),
    StartTime(String),
    EndTime(String),
    Outputs(Outputs),
    Metadata(Metadata),
    ExitCode(i32),
    HostIp(String),
    Ports(PortBindings),
    Stdout(String),
    Stderr(String),
    SystemLog(SystemLog),
}

impl Payload {
    /// ¿Es este brazo válido para el tipo de evento dado?
    pub fn matches(&self, kind: EventType) -> bool {
        use EventType::*;
        matches!(
            (self, kind),
            (Payload::Task(_), TaskCreated)
                | (Payload::State(_), TaskState)
                | (Payload::StartTime(_), TaskStartTime | ExecutorStartTime)
                | (Payload::EndTime(_), TaskEndTime | ExecutorEndTime)
                | (Payload::Outputs(_), TaskOutputs)
                | (Payload::Metadata(_), TaskMetadata)
                | (Payload::ExitCode(_), ExecutorExitCode)
                | (Payload::HostIp(_), ExecutorHostIp)
                | (Payload::Ports(_), ExecutorPorts)
                | (Payload::Stdout(_), ExecutorStdout)
                | (Payload::Stderr(_), ExecutorStderr)
                | (Payload::SystemLog(_), EventType::SystemLog)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Event {
    pub fn new(id: impl Into<String>, kind: EventType, payload: Payload) -> Self {
        Event {
            id: id.into(),
            timestamp: now(),
            attempt: 0,
            index: 0,
            kind,
            payload,
        }
    }

    pub fn scoped(mut self, attempt: u32, index: u32) -> Self {
        self.attempt = attempt;
        self.index = index;
        self
    }

    pub fn created(task: Task) -> Self {
        Event::new(task.id.clone(), EventType::TaskCreated, Payload::Task(Box::new(task)))
    }

    pub fn state(id: &str, state: State) -> Self {
        Event::new(id, EventType::TaskState, Payload::State(state))
    }

    pub fn start_time(id: &str, attempt: u32, t: DateTime<Utc>) -> Self {
        Event::new(id, EventType::TaskStartTime, Payload::StartTime(timestamp(t)))
            .scoped(attempt, 0)
    }

    pub fn end_time(id: &str, attempt: u32, t: DateTime<Utc>) -> Self {
        Event::new(id, EventType::TaskEndTime, Payload::EndTime(timestamp(t))).scoped(attempt, 0)
    }

    pub fn outputs(id: &str, attempt: u32, value: Vec<OutputFileLog>) -> Self {
        Event::new(id, EventType::TaskOutputs, Payload::Outputs(Outputs { value }))
            .scoped(attempt, 0)
    }

    pub fn metadata(id: &str, attempt: u32, value: BTreeMap<String, String>) -> Self {
        Event::new(id, EventType::TaskMetadata, Payload::Metadata(Metadata { value }))
            .scoped(attempt, 0)
    }

    pub fn executor_start_time(id: &str, attempt: u32, index: u32, t: DateTime<Utc>) -> Self {
        Event::new(id, EventType::ExecutorStartTime, Payload::StartTime(timestamp(t)))
            .scoped(attempt, index)
    }

    pub fn executor_end_time(id: &str, attempt: u32, index: u32, t: DateTime<Utc>) -> Self {
        Event::new(id, EventType::ExecutorEndTime, Payload::EndTime(timestamp(t)))
            .scoped(attempt, index)
    }

    pub fn exit_code(id: &str, attempt: u32, index: u32, code: i32) -> Self {
        Event::new(id, EventType::ExecutorExitCode, Payload::ExitCode(code)).scoped(attempt, index)
    }

    pub fn host_ip(id: &str, attempt: u32, index: u32, ip: &str) -> Self {
        Event::new(id, EventType::ExecutorHostIp, Payload::HostIp(ip.to_owned()))
            .scoped(attempt, index)
    }

    pub fn ports(id: &str, attempt: u32, index: u32, value: Vec<Ports>) -> Self {
        Event::new(id, EventType::ExecutorPorts, Payload::Ports(PortBindings { value }))
            .scoped(attempt, index)
    }

    pub fn stdout(id: &str, attempt: u32, index: u32, chunk: String) -> Self {
        Event::new(id, EventType::ExecutorStdout, Payload::Stdout(chunk)).scoped(attempt, index)
    }

    pub fn stderr(id: &str, attempt: u32, index: u32, chunk: String) -> Self {
        Event::new(id, EventType::ExecutorStderr, Payload::Stderr(chunk)).scoped(attempt, index)
    }

    pub fn system_log(
        id: &str,
        attempt: u32,
        index: u32,
        level: Level,
        msg: &str,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Event::new(
            id,
            EventType::SystemLog,
            Payload::SystemLog(SystemLog {
                level: level.as_str().to_owned(),
                msg: msg.to_owned(),
                fields,
            }),
        )
        .scoped(attempt, index)
    }

    pub fn is_consistent(&self) -> bool {
        self.payload.matches(self.kind)
    }
}

/* --------- Niveles de system log --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }

    /// Nivel desconocido cuenta como info.
    pub fn parse(s: &str) -> Level {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }
}

/// Representación textual de un system log dentro de `TaskLog.systemLogs`.
pub fn syslog_string(ev_timestamp: &str, log: &SystemLog) -> String {
    let mut s = format!(
        "level='{}' msg='{}' timestamp='{}'",
        log.level,
        escape(&log.msg),
        ev_timestamp
    );
    for (k, v) in &log.fields {
        s.push_str(&format!(" {}='{}'", k, escape(v)));
    }
    s
}

fn escape(s: &str) -> String {
    s.replace('\'', "\\'")
}

/// Helper para construir el mapa de campos: `fields([("url", u)])`.
pub fn fields<K, V, I>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}
