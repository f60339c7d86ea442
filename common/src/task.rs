use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type TaskId = String;

/* --------- Estados de una tarea --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    #[default]
    Unknown,
    Queued,
    Initializing,
    Running,
    Paused,
    Complete,
    ExecutorError,
    SystemError,
    Canceled,
}

impl State {
    pub const ALL: [State; 9] = [
        State::Unknown,
        State::Queued,
        State::Initializing,
        State::Running,
        State::Paused,
        State::Complete,
        State::ExecutorError,
        State::SystemError,
        State::Canceled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Complete | State::ExecutorError | State::SystemError | State::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Queued => "QUEUED",
            State::Initializing => "INITIALIZING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Complete => "COMPLETE",
            State::ExecutorError => "EXECUTOR_ERROR",
            State::SystemError => "SYSTEM_ERROR",
            State::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    #[default]
    File,
    Directory,
}

/// Proyección pedida en GetTask / ListTasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum View {
    #[default]
    Minimal,
    Basic,
    Full,
}

impl FromStr for View {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "" | "MINIMAL" => Ok(View::Minimal),
            "BASIC" => Ok(View::Basic),
            "FULL" => Ok(View::Full),
            other => Err(format!("unknown view: {other}")),
        }
    }
}

/* --------- Definición de la tarea (TES) --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: TaskId,
    pub state: State,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Input>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub executors: Vec<Executor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<TaskLog>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub creation_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Input {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(skip_serializing_if = "is_false")]
    pub streamable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Output {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub url: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resources {
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub cpu_cores: i32,
    #[serde(skip_serializing_if = "is_false")]
    pub preemptible: bool,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub ram_gb: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub disk_gb: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub backend_parameters: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_false")]
    pub backend_parameters_strict: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Executor {
    pub image: String,
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub workdir: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdin: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Ports>,
    #[serde(skip_serializing_if = "is_false")]
    pub ignore_error: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ports {
    pub container: u32,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub host: u32,
}

/* --------- Logs por intento y por executor --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskLog {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<ExecutorLog>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub start_time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub end_time: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputFileLog>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub system_logs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorLog {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub start_time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub end_time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Ports>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputFileLog {
    pub url: String,
    pub path: String,
    /// int64 en proto3-JSON viaja como string.
    pub size_bytes: String,
}

impl Task {
    /// Recursos pedidos, o la petición vacía si no declara ninguno.
    pub fn requested(&self) -> Resources {
        self.resources.clone().unwrap_or_default()
    }

    pub fn view(&self, view: View) -> Task {
        match view {
            View::Minimal => Task {
                id: self.id.clone(),
                state: self.state,
                ..Default::default()
            },
            View::Basic => {
                let mut t = self.clone();
                for input in &mut t.inputs {
                    input.content.clear();
                }
                for log in &mut t.logs {
                    log.system_logs.clear();
                    for exec in &mut log.logs {
                        exec.stdout.clear();
                        exec.stderr.clear();
                    }
                }
                t
            }
            View::Full => self.clone(),
        }
    }
}

impl Executor {
    /// Puertos host declarados distintos de cero (0 = aleatorio).
    pub fn host_ports(&self) -> impl Iterator<Item = u32> + '_ {
        self.ports.iter().map(|p| p.host).filter(|p| *p != 0)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_task() -> Task {
        Task {
            id: "t1".into(),
            state: State::Running,
            inputs: vec![Input {
                path: "/in/a.txt".into(),
                content: "hola".into(),
                ..Default::default()
            }],
            executors: vec![Executor {
                image: "alpine".into(),
                command: vec!["echo".into(), "hi".into()],
                ..Default::default()
            }],
            logs: vec![TaskLog {
                system_logs: vec!["level='info' msg='x'".into()],
                logs: vec![ExecutorLog {
                    stdout: "hi\n".into(),
                    stderr: "warn\n".into(),
                    exit_code: 0,
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn minimal_view_keeps_only_id_and_state() {
        let t = full_task().view(View::Minimal);
        assert_eq!(t.id, "t1");
        assert_eq!(t.state, State::Running);
        assert!(t.executors.is_empty());
        assert!(t.logs.is_empty());
    }

    #[test]
    fn basic_view_strips_logs_and_content() {
        let t = full_task().view(View::Basic);
        assert_eq!(t.executors.len(), 1);
        assert!(t.inputs[0].content.is_empty());
        assert!(t.logs[0].system_logs.is_empty());
        assert!(t.logs[0].logs[0].stdout.is_empty());
        assert!(t.logs[0].logs[0].stderr.is_empty());
    }

    #[test]
    fn full_view_is_identity() {
        let t = full_task();
        assert_eq!(t.view(View::Full), t);
    }

    #[test]
    fn task_json_uses_camel_case() {
        let t = Task {
            resources: Some(Resources {
                cpu_cores: 2,
                ram_gb: 1.5,
                ..Default::default()
            }),
            executors: vec![Executor {
                image: "alpine".into(),
                command: vec!["true".into()],
                ignore_error: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["resources"]["cpuCores"], 2);
        assert_eq!(v["resources"]["ramGb"], 1.5);
        assert_eq!(v["executors"][0]["ignoreError"], true);
        assert_eq!(v["state"], "UNKNOWN");
        assert!(v.get("id").is_none());
    }

    #[test]
    fn state_parses_case_insensitive() {
        assert_eq!("executor_error".parse::<State>().unwrap(), State::ExecutorError);
        assert!("nope".parse::<State>().is_err());
    }
}
