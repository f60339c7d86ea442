//! Planificador de nodos: reparte tareas QUEUED entre los nodos registrados.

pub mod predicates;
pub mod reaper;
pub mod scaler;
pub mod scores;

use std::sync::Arc;
use tracing::{debug, info, warn};

use common::config::SchedulerConfig;
use common::writer::{EventWriter, MultiWriter};
use common::{Context, Node};

use crate::store::{MemoryStore, NodeRegistry, StoreError, TaskStore};
use predicates::Predicate;
use scaler::{CommandScaler, Scaler};
use scores::Score;

pub struct Scheduler {
    store: Arc<MemoryStore>,
    // los eventos de asignación ya están en el store; aquí solo se reenvían
    sinks: Arc<MultiWriter>,
    conf: SchedulerConfig,
    predicates: Vec<Predicate>,
    scores: Vec<(&'static str, Score)>,
    scaler: Option<Arc<dyn Scaler>>,
}

impl Scheduler {
    pub fn new(store: Arc<MemoryStore>, sinks: Arc<MultiWriter>, conf: SchedulerConfig) -> Self {
        Scheduler {
            store,
            sinks,
            conf,
            predicates: predicates::defaults(),
            scores: scores::defaults(),
            scaler: None,
        }
    }

    /// Scheduler con los filtros de etiqueta y el autoescalado de `conf`.
    pub fn from_config(store: Arc<MemoryStore>, sinks: Arc<MultiWriter>, conf: SchedulerConfig) -> Self {
        let tags = conf.node_tags.clone();
        let command = conf.scaler_command.clone();
        let mut sched = Scheduler::new(store, sinks, conf);
        for key in tags {
            sched = sched.with_predicate(predicates::node_has_tag(key));
        }
        if !command.is_empty() {
            info!("autoescalado por comando activado");
            sched = sched.with_scaler(Arc::new(CommandScaler::new(command)));
        }
        sched
    }

    pub fn with_predicate(mut self, p: Predicate) -> Self {
        self.predicates.push(p);
        self
    }

    pub fn with_scaler(mut self, s: Arc<dyn Scaler>) -> Self {
        self.scaler = Some(s);
        self
    }

    pub async fn run(&self, ctx: Context) {
        info!(
            "scheduler activo: cada {:?}, hasta {} tareas por tick",
            self.conf.schedule_rate(),
            self.conf.schedule_chunk
        );
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(self.conf.schedule_rate()) => {}
            }
            self.tick().await;
        }
        debug!("scheduler detenido");
    }

    /// Un tick: asigna hasta `schedule_chunk` tareas y luego autoescala.
    /// Devuelve cuántas tareas se asignaron.
    pub async fn tick(&self) -> usize {
        let assigned = self.schedule_chunk().await;
        if let Some(scaler) = &self.scaler {
            scaler::scale(self.store.as_ref(), scaler.as_ref()).await;
        }
        assigned
    }

    async fn schedule_chunk(&self) -> usize {
        let queue = self.store.read_queue(self.conf.schedule_chunk).await;
        if queue.is_empty() {
            return 0;
        }
        let mut nodes: Vec<Node> = self.store.list_nodes().await;
        let mut assigned = 0;

        for task in queue {
            let candidates = nodes
                .iter()
                .filter(|n| predicates::all_match(&self.predicates, &task, n));
            let Some(best) = scores::pick(&self.scores, &self.conf.score_weights, &task, candidates)
            else {
                debug!(task_id = %task.id, "sin nodo que encaje, sigue en cola");
                continue;
            };
            let node_id = best.id.clone();

            match self.store.assign_task(&task.id, &node_id, best.version).await {
                Ok(events) => {
                    info!(task_id = %task.id, node_id = %node_id, "tarea asignada");
                    assigned += 1;
                    for ev in &events {
                        if let Err(e) = self.sinks.write_event(ev).await {
                            warn!(task_id = %task.id, "writer secundario falló: {e}");
                        }
                    }
                }
                // carrera perdida con un heartbeat: se reintenta en el siguiente tick
                Err(StoreError::VersionOutdated { .. }) => {
                    debug!(task_id = %task.id, node_id = %node_id, "versión de nodo obsoleta");
                }
                Err(e) => {
                    warn!(task_id = %task.id, "no se pudo asignar la tarea: {e}");
                }
            }

            // recursos y versión del nodo cambiaron; refrescar la copia local
            if let Ok(fresh) = self.store.get_node(&node_id).await {
                if let Some(slot) = nodes.iter_mut().find(|n| n.id == node_id) {
                    *slot = fresh;
                }
            }
        }
        assigned
    }
}
