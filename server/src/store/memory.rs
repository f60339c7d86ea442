use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use common::api::{ListTasksRequest, ListTasksResponse};
use common::events::fields;
use common::ids::is_valid_id;
use common::page::clamp_page_size;
use common::reducer::{self, ReduceError};
use common::writer::{EventWriter, WriteError};
use common::{Event, EventType, Node, NodeState, State, Task, View};

use super::{Journal, NodeRegistry, StoreError, TaskStore};

/// Store orientado a eventos en memoria, con diario opcional en disco.
///
/// Todas las escrituras pasan por el reducer; es el único estado mutable
/// compartido del servidor.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_log_size: usize,
}

#[derive(Default)]
struct Inner {
    // BTreeMap: los ids (ULID) ordenan por creación
    tasks: BTreeMap<String, Task>,
    nodes: BTreeMap<String, Node>,
    // tarea -> nodo al que está asignada
    assigned: HashMap<String, String>,
    journal: Option<Journal>,
}

impl MemoryStore {
    pub fn new(max_log_size: usize) -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
            max_log_size,
        }
    }

    /// Abre el diario y reconstruye las tareas plegando sus eventos.
    pub fn open(path: &Path, max_log_size: usize) -> Result<Self, StoreError> {
        let (journal, events) = Journal::open(path)?;
        let store = MemoryStore::new(max_log_size);
        {
            let mut inner = store.lock();
            for ev in &events {
                if let Err(e) = inner.apply(ev, max_log_size) {
                    debug!(task_id = %ev.id, "evento del diario descartado: {e}");
                }
            }
            info!("diario {} cargado: {} eventos, {} tareas", path.display(), events.len(), inner.tasks.len());
            inner.journal = Some(journal);
        }
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Aplica un evento a su tarea. No toca el diario.
    fn apply(&mut self, ev: &Event, max_log: usize) -> Result<(), StoreError> {
        if !ev.is_consistent() {
            return Err(StoreError::InvalidArgument(format!(
                "event type {} does not match its payload",
                ev.kind
            )));
        }
        if ev.id.is_empty() {
            return Err(StoreError::InvalidArgument("event without task id".into()));
        }

        if ev.kind == EventType::TaskCreated {
            if self.tasks.contains_key(&ev.id) {
                return Err(StoreError::InvalidArgument(format!("task {} already exists", ev.id)));
            }
            let mut task = Task::default();
            reducer::apply(&mut task, ev, max_log)?;
            self.tasks.insert(ev.id.clone(), task);
            return Ok(());
        }

        let task = self
            .tasks
            .get_mut(&ev.id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", ev.id)))?;
        let was_terminal = task.state.is_terminal();

        // el reducer no muta nada si falla
        reducer::apply(task, ev, max_log)?;

        if !was_terminal && task.state.is_terminal() {
            self.unlink(&ev.id);
        }
        Ok(())
    }

    fn journal(&mut self, ev: &Event) {
        if let Some(j) = self.journal.as_mut() {
            if let Err(e) = j.append(ev) {
                error!(task_id = %ev.id, "no se pudo escribir en el diario: {e}");
            }
        }
    }

    /// Suelta la tarea del nodo que la tenía asignada.
    fn unlink(&mut self, task_id: &str) {
        let Some(node_id) = self.assigned.remove(task_id) else {
            return;
        };
        if let Some(mut node) = self.nodes.remove(&node_id) {
            node.task_ids.retain(|id| id != task_id);
            self.refresh(&mut node);
            self.nodes.insert(node_id, node);
        }
    }

    /// Recalcula recursos y puertos disponibles a partir de las tareas asignadas.
    fn refresh(&self, node: &mut Node) {
        let assigned: Vec<&Task> = node
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect();
        node.available = node.compute_available(assigned.iter().copied());
        node.active_ports = Node::compute_ports(assigned.iter().copied());
    }
}

/* ---------------- escritura de eventos ---------------- */

#[async_trait]
impl EventWriter for MemoryStore {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        let mut inner = self.lock();
        match inner.apply(ev, self.max_log_size) {
            Ok(()) => {
                inner.journal(ev);
                Ok(())
            }
            // transición inválida: se registra y se descarta, el writer no falla
            Err(StoreError::Reduce(ReduceError::Transition(e))) => {
                warn!(task_id = %ev.id, "evento descartado: {e}");
                Ok(())
            }
            Err(StoreError::NotFound(m)) => Err(WriteError::NotFound(m)),
            Err(StoreError::InvalidArgument(m)) => Err(WriteError::InvalidArgument(m)),
            Err(StoreError::Reduce(e)) => Err(WriteError::InvalidArgument(e.to_string())),
            Err(e) => Err(WriteError::Other(e.to_string())),
        }
    }
}

/* ---------------- lectura de tareas ---------------- */

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_task(&self, id: &str, view: View) -> Result<Task, StoreError> {
        let inner = self.lock();
        inner
            .tasks
            .get(id)
            .map(|t| t.view(view))
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    async fn list_tasks(&self, req: &ListTasksRequest) -> Result<ListTasksResponse, StoreError> {
        if !req.page_token.is_empty() && !is_valid_id(&req.page_token) {
            return Err(StoreError::InvalidArgument(format!(
                "invalid page token: {}",
                req.page_token
            )));
        }
        let size = clamp_page_size(req.page_size);
        let inner = self.lock();

        let candidates: Box<dyn Iterator<Item = &Task>> = if req.page_token.is_empty() {
            Box::new(inner.tasks.values().rev())
        } else {
            Box::new(inner.tasks.range(..req.page_token.clone()).rev().map(|(_, t)| t))
        };

        let mut tasks = Vec::with_capacity(size.min(inner.tasks.len()));
        let mut more = false;
        for t in candidates.filter(|t| req.matches(t)) {
            if tasks.len() == size {
                more = true;
                break;
            }
            tasks.push(t.view(req.view));
        }

        let next_page_token = match tasks.last() {
            Some(last) if more => last.id.clone(),
            _ => String::new(),
        };
        Ok(ListTasksResponse {
            tasks,
            next_page_token,
        })
    }

    async fn read_queue(&self, n: usize) -> Vec<Task> {
        let inner = self.lock();
        inner
            .tasks
            .values()
            .filter(|t| t.state == State::Queued)
            .take(n)
            .cloned()
            .collect()
    }
}

/* ---------------- registro de nodos ---------------- */

fn check_version(stored: &Node, got: u64) -> Result<(), StoreError> {
    if got != 0 && got < stored.version {
        return Err(StoreError::VersionOutdated {
            stored: stored.version,
            got,
        });
    }
    Ok(())
}

#[async_trait]
impl NodeRegistry for MemoryStore {
    async fn get_node(&self, id: &str) -> Result<Node, StoreError> {
        let inner = self.lock();
        inner
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))
    }

    async fn list_nodes(&self) -> Vec<Node> {
        self.lock().nodes.values().cloned().collect()
    }

    async fn update_node(&self, req: Node) -> Result<Node, StoreError> {
        if req.id.is_empty() {
            return Err(StoreError::InvalidArgument("node id is required".into()));
        }
        let mut inner = self.lock();
        let now = Utc::now().timestamp();

        let mut node = match inner.nodes.get(&req.id) {
            Some(stored) => {
                check_version(stored, req.version)?;
                let mut node = stored.clone();
                if req.resources.cpus > 0 {
                    node.resources.cpus = req.resources.cpus;
                }
                if req.resources.ram_gb > 0.0 {
                    node.resources.ram_gb = req.resources.ram_gb;
                }
                if req.resources.disk_gb > 0.0 {
                    node.resources.disk_gb = req.resources.disk_gb;
                }
                if !req.zone.is_empty() {
                    node.zone = req.zone.clone();
                }
                if !req.hostname.is_empty() {
                    node.hostname = req.hostname.clone();
                }
                node.preemptible = req.preemptible;
                node.state = req.state;
                node.metadata.extend(req.metadata.clone());
                node.version = node.version.max(req.version) + 1;
                node
            }
            None => {
                info!(node_id = %req.id, "nodo registrado: {}", req.hostname);
                Node {
                    task_ids: Vec::new(),
                    version: req.version + 1,
                    ..req.clone()
                }
            }
        };

        // tareas que el nodo da por terminadas y el servidor también
        for id in &req.task_ids {
            let terminal = inner.tasks.get(id).is_some_and(|t| t.state.is_terminal());
            if terminal && node.task_ids.contains(id) {
                node.task_ids.retain(|t| t != id);
                inner.assigned.remove(id);
            }
        }

        node.last_ping = now;
        inner.refresh(&mut node);
        inner.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    async fn set_node_state(
        &self,
        id: &str,
        state: NodeState,
        expected_version: u64,
    ) -> Result<Node, StoreError> {
        let mut inner = self.lock();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))?;
        if expected_version != 0 && node.version != expected_version {
            return Err(StoreError::VersionOutdated {
                stored: node.version,
                got: expected_version,
            });
        }
        node.state = state;
        node.version += 1;
        Ok(node.clone())
    }

    async fn delete_node(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let node = inner
            .nodes
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))?;
        for t in &node.task_ids {
            inner.assigned.remove(t);
        }
        Ok(())
    }

    async fn assign_task(
        &self,
        task_id: &str,
        node_id: &str,
        expected_version: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let mut inner = self.lock();

        let node = inner
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
        if node.version != expected_version {
            return Err(StoreError::VersionOutdated {
                stored: node.version,
                got: expected_version,
            });
        }
        let state = inner
            .tasks
            .get(task_id)
            .map(|t| t.state)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        if state != State::Queued {
            return Err(StoreError::InvalidArgument(format!(
                "task {task_id} is {state}, not QUEUED"
            )));
        }

        let events = vec![
            Event::state(task_id, State::Initializing),
            Event::metadata(task_id, 0, fields([("nodeId", node_id)])),
        ];
        for ev in &events {
            inner.apply(ev, self.max_log_size)?;
            inner.journal(ev);
        }

        inner.assigned.insert(task_id.to_owned(), node_id.to_owned());
        if let Some(mut node) = inner.nodes.remove(node_id) {
            node.task_ids.push(task_id.to_owned());
            node.version += 1;
            inner.refresh(&mut node);
            inner.nodes.insert(node_id.to_owned(), node);
        }
        Ok(events)
    }
}
