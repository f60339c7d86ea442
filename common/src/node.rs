use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::task::{self, Task};

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    #[default]
    Uninitialized,
    Initializing,
    Alive,
    Dead,
    Gone,
}

/// Recursos de un nodo (declarados o disponibles).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resources {
    pub cpus: u32,
    pub ram_gb: f64,
    pub disk_gb: f64,
}

impl Resources {
    /// Resta una petición de tarea, sin bajar de cero.
    pub fn subtract(&self, req: &task::Resources) -> Resources {
        let cpus = i64::from(self.cpus) - i64::from(req.cpu_cores.max(0));
        Resources {
            cpus: cpus.max(0) as u32,
            ram_gb: (self.ram_gb - req.ram_gb).max(0.0),
            disk_gb: (self.disk_gb - req.disk_gb).max(0.0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    pub id: NodeId,
    pub resources: Resources,
    pub available: Resources,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub active_ports: Vec<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub zone: String,
    pub preemptible: bool,
    pub task_ids: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Epoch en segundos del último heartbeat.
    pub last_ping: i64,
    pub state: NodeState,
    pub version: u64,
}

impl Node {
    pub fn is_dead(&self) -> bool {
        matches!(self.state, NodeState::Dead | NodeState::Gone)
    }

    /// declarado - Σ peticiones de las tareas asignadas no terminales (en cero como mínimo).
    pub fn compute_available<'a, I>(&self, assigned: I) -> Resources
    where
        I: IntoIterator<Item = &'a Task>,
    {
        assigned
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .fold(self.resources, |acc, t| acc.subtract(&t.requested()))
    }

    /// Puertos host ocupados por las tareas asignadas.
    pub fn compute_ports<'a, I>(assigned: I) -> Vec<u32>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let mut ports: Vec<u32> = assigned
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .flat_map(|t| t.executors.iter().flat_map(|e| e.host_ports()).collect::<Vec<_>>())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Executor, Ports, State};

    fn task(cpu: i32, ram: f64, state: State) -> Task {
        Task {
            state,
            resources: Some(task::Resources {
                cpu_cores: cpu,
                ram_gb: ram,
                disk_gb: 1.0,
                ..Default::default()
            }),
            executors: vec![Executor {
                ports: vec![Ports { container: 80, host: 8080 }, Ports { container: 81, host: 0 }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn available_subtracts_non_terminal_requests() {
        let node = Node {
            resources: Resources { cpus: 4, ram_gb: 8.0, disk_gb: 10.0 },
            ..Default::default()
        };
        let tasks = [
            task(2, 3.0, State::Running),
            task(1, 1.0, State::Initializing),
            task(4, 4.0, State::Complete),
        ];
        let avail = node.compute_available(&tasks);
        assert_eq!(avail, Resources { cpus: 1, ram_gb: 4.0, disk_gb: 8.0 });
    }

    #[test]
    fn available_is_floored_at_zero() {
        let node = Node {
            resources: Resources { cpus: 1, ram_gb: 1.0, disk_gb: 0.5 },
            ..Default::default()
        };
        let avail = node.compute_available(&[task(8, 16.0, State::Running)]);
        assert_eq!(avail, Resources::default());
    }

    #[test]
    fn ports_skip_random_assignments() {
        let ports = Node::compute_ports(&[task(1, 1.0, State::Running), task(1, 1.0, State::Running)]);
        assert_eq!(ports, vec![8080]);
    }
}
