//! Proceso de nodo: heartbeat contra el servidor y un worker por cada
//! tarea asignada.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use common::client::Client;
use common::config::Config;
use common::node::{self, Node, NodeState};
use common::Context;

use crate::engine::Engine;
use crate::reader::RpcTaskReader;
use crate::util;

pub struct NodeAgent {
    id: String,
    conf: Config,
    client: Client,
    engine: Arc<Engine>,
    resources: node::Resources,
    hostname: String,
}

impl NodeAgent {
    pub fn new(conf: Config, client: Client, engine: Arc<Engine>) -> Self {
        let id = if conf.node.id.is_empty() {
            format!("node-{}", uuid::Uuid::new_v4())
        } else {
            conf.node.id.clone()
        };
        let detected = util::host_resources(&conf.worker.work_dir);
        let resources = node::Resources {
            cpus: if conf.node.cpus > 0 { conf.node.cpus } else { detected.cpus },
            ram_gb: if conf.node.ram_gb > 0.0 { conf.node.ram_gb } else { detected.ram_gb },
            disk_gb: if conf.node.disk_gb > 0.0 { conf.node.disk_gb } else { detected.disk_gb },
        };
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        NodeAgent {
            id,
            conf,
            client,
            engine,
            resources,
            hostname,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bucle del nodo. Termina al cancelar `ctx` o tras `node.timeout_secs`
    /// sin tareas estando ALIVE; en ambos casos espera a los workers y se
    /// despide con GONE.
    pub async fn run(&self, ctx: &Context) {
        info!(
            node_id = %self.id,
            cpus = self.resources.cpus,
            ram_gb = self.resources.ram_gb,
            disk_gb = self.resources.disk_gb,
            "nodo arrancado"
        );
        let mut seen = HashSet::new();
        let mut workers = JoinSet::new();
        let mut idle_since = Instant::now();
        let mut state = NodeState::Uninitialized;
        let mut ticker = tokio::time::interval(self.conf.node.update_rate());

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }
            while let Some(res) = workers.try_join_next() {
                if let Err(e) = res {
                    warn!(node_id = %self.id, "worker terminó mal: {e}");
                }
            }

            if let Some(s) = self.sync(ctx, &mut seen, &mut workers).await {
                state = s;
            }

            if !workers.is_empty() || state != NodeState::Alive {
                idle_since = Instant::now();
            } else if let Some(limit) = self.conf.node.idle_timeout() {
                if idle_since.elapsed() >= limit {
                    info!(node_id = %self.id, "nodo inactivo, apagando");
                    break;
                }
            }
        }

        self.drain(&mut workers, self.conf.node.shutdown_grace()).await;
        self.goodbye().await;
        info!(node_id = %self.id, "nodo parado");
    }

    /// Lee el registro del nodo, lanza las tareas nuevas y manda el heartbeat.
    /// Devuelve el estado del nodo en el servidor tras la sincronización, o
    /// `None` si no se pudo leer.
    async fn sync(
        &self,
        ctx: &Context,
        seen: &mut HashSet<String>,
        workers: &mut JoinSet<()>,
    ) -> Option<NodeState> {
        let (version, task_ids, mut state) = match self.client.get_node(&self.id).await {
            Ok(n) => (n.version, n.task_ids, n.state),
            Err(e) if e.is_not_found() => (0, Vec::new(), NodeState::Uninitialized),
            Err(e) => {
                warn!(node_id = %self.id, "no se pudo leer el nodo: {e}");
                return None;
            }
        };

        // una tarea desasignada ya es terminal y no vuelve
        seen.retain(|id| task_ids.contains(id));
        for task_id in &task_ids {
            if !seen.insert(task_id.clone()) {
                continue;
            }
            let engine = self.engine.clone();
            let reader = Arc::new(RpcTaskReader::new(self.client.clone(), task_id.clone()));
            let task_ctx = ctx.child();
            let task_id = task_id.clone();
            workers.spawn(async move {
                match engine.run(&task_ctx, reader).await {
                    Ok(state) => debug!(task_id = %task_id, %state, "worker terminado"),
                    Err(e) => warn!(task_id = %task_id, "worker sin tarea: {e}"),
                }
            });
        }

        let heartbeat = self.heartbeat(version, task_ids, NodeState::Alive);
        match self.client.update_node(&heartbeat).await {
            Ok(_) => state = NodeState::Alive,
            Err(e) if e.status() == Some(409) => {
                debug!(node_id = %self.id, "heartbeat con versión vieja, se reintenta");
            }
            Err(e) => warn!(node_id = %self.id, "heartbeat fallido: {e}"),
        }
        debug!(node_id = %self.id, running = workers.len(), state = ?state, "heartbeat");
        Some(state)
    }

    fn heartbeat(&self, version: u64, task_ids: Vec<String>, state: NodeState) -> Node {
        Node {
            id: self.id.clone(),
            resources: self.resources,
            zone: self.conf.node.zone.clone(),
            preemptible: self.conf.node.preemptible,
            task_ids,
            metadata: self.conf.node.metadata.clone(),
            hostname: self.hostname.clone(),
            state,
            version,
            ..Default::default()
        }
    }

    async fn drain(&self, workers: &mut JoinSet<()>, grace: Duration) {
        if workers.is_empty() {
            return;
        }
        info!(node_id = %self.id, pending = workers.len(), "esperando a los workers");
        let wait = async { while workers.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!(node_id = %self.id, "workers sin terminar tras el periodo de gracia");
            workers.abort_all();
        }
    }

    async fn goodbye(&self) {
        let (version, task_ids) = match self.client.get_node(&self.id).await {
            Ok(n) => (n.version, n.task_ids),
            Err(_) => (0, Vec::new()),
        };
        let node = self.heartbeat(version, task_ids, NodeState::Gone);
        if let Err(e) = self.client.update_node(&node).await {
            warn!(node_id = %self.id, "no se pudo mandar el último heartbeat: {e}");
        }
    }
}
