use chrono::Utc;
use tracing::{debug, info, warn};

use common::config::SchedulerConfig;
use common::events::fields;
use common::writer::{EventWriter, TaskEvents};
use common::{Context, Node, NodeState, State, View};
use std::sync::Arc;

use crate::state::AppState;
use crate::store::{MemoryStore, NodeRegistry, TaskStore};

/// Resultado de una pasada, para logs y tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reaped {
    pub dead: Vec<String>,
    pub gone: Vec<String>,
    pub removed: Vec<String>,
    pub failed_tasks: Vec<String>,
}

/// Loop de detección de nodos muertos.
pub async fn run_reaper(state: AppState, ctx: Context) {
    let rate = state.conf.scheduler.schedule_rate();
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = tokio::time::sleep(rate) => {}
        }
        let r = reap_once(
            &state.store,
            state.writer.clone(),
            &state.conf.scheduler,
            Utc::now().timestamp(),
        )
        .await;
        if !r.dead.is_empty() || !r.removed.is_empty() {
            debug!(?r, "pasada del reaper");
        }
    }
    debug!("reaper detenido");
}

/// Una pasada sobre todos los nodos:
/// 1. GONE -> se borra del registro
/// 2. sin ping más allá del umbral -> DEAD (init timeout si aún no está ALIVE)
/// 3. DEAD durante más de node_dead_timeout -> GONE
/// Las tareas vivas de un nodo DEAD o GONE pasan a SYSTEM_ERROR.
pub async fn reap_once(
    store: &MemoryStore,
    writer: Arc<dyn EventWriter>,
    conf: &SchedulerConfig,
    now: i64,
) -> Reaped {
    let mut out = Reaped::default();

    for node in store.list_nodes().await {
        let age = now.saturating_sub(node.last_ping).max(0) as u64;

        match node.state {
            NodeState::Gone => {
                fail_tasks(store, &writer, &node, &mut out).await;
                match store.delete_node(&node.id).await {
                    Ok(()) => {
                        info!(node_id = %node.id, "nodo eliminado del registro");
                        out.removed.push(node.id.clone());
                    }
                    Err(e) => debug!(node_id = %node.id, "no se pudo eliminar el nodo: {e}"),
                }
            }
            NodeState::Dead => {
                fail_tasks(store, &writer, &node, &mut out).await;
                if age > conf.node_dead_timeout_secs
                    && transition(store, &node, NodeState::Gone).await
                {
                    out.gone.push(node.id.clone());
                }
            }
            NodeState::Uninitialized | NodeState::Initializing | NodeState::Alive => {
                let limit = if node.state == NodeState::Alive {
                    conf.node_ping_timeout_secs
                } else {
                    conf.node_init_timeout_secs
                };
                if age <= limit {
                    continue;
                }
                if transition(store, &node, NodeState::Dead).await {
                    warn!(node_id = %node.id, "marcando nodo como DEAD (sin heartbeat hace {age}s)");
                    out.dead.push(node.id.clone());
                    fail_tasks(store, &writer, &node, &mut out).await;
                }
            }
        }
    }
    out
}

async fn transition(store: &MemoryStore, node: &Node, to: NodeState) -> bool {
    match store.set_node_state(&node.id, to, node.version).await {
        Ok(_) => true,
        // llegó un heartbeat entre medias: se revisa en el siguiente tick
        Err(e) => {
            debug!(node_id = %node.id, "cambio de estado de nodo descartado: {e}");
            false
        }
    }
}

async fn fail_tasks(
    store: &MemoryStore,
    writer: &Arc<dyn EventWriter>,
    node: &Node,
    out: &mut Reaped,
) {
    for id in &node.task_ids {
        let Ok(task) = store.get_task(id, View::Minimal).await else {
            continue;
        };
        if task.state.is_terminal() {
            continue;
        }
        warn!(task_id = %id, node_id = %node.id, "tarea en nodo muerto, pasando a SYSTEM_ERROR");
        let events = TaskEvents::new(id.clone(), 0, writer.clone());
        events
            .error("node died", fields([("node_id", node.id.as_str())]))
            .await;
        events.state(State::SystemError).await;
        out.failed_tasks.push(id.clone());
    }
}
