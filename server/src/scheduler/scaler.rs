use async_trait::async_trait;
use tracing::{debug, info, warn};

use common::{Node, NodeState};

use crate::compute::run_script;
use crate::store::NodeRegistry;

/// Capacidad opcional de un backend para arrancar nodos bajo demanda.
#[async_trait]
pub trait Scaler: Send + Sync {
    fn should_start_node(&self, node: &Node) -> bool;

    async fn start_node(&self, node: &Node) -> anyhow::Result<()>;
}

/// Arranca los nodos UNINITIALIZED lanzando un comando de plantilla.
pub struct CommandScaler {
    template: String,
}

impl CommandScaler {
    pub fn new(template: impl Into<String>) -> Self {
        CommandScaler {
            template: template.into(),
        }
    }

    fn render(&self, node: &Node) -> String {
        self.template
            .replace("{{node_id}}", &node.id)
            .replace("{{zone}}", &node.zone)
    }
}

#[async_trait]
impl Scaler for CommandScaler {
    fn should_start_node(&self, node: &Node) -> bool {
        node.state == NodeState::Uninitialized
    }

    async fn start_node(&self, node: &Node) -> anyhow::Result<()> {
        let out = run_script(&self.render(node))
            .await
            .map_err(|stderr| anyhow::anyhow!("scaler command failed: {stderr}"))?;
        debug!(node_id = %node.id, "scaler: {out}");
        Ok(())
    }
}

/// Una pasada de autoescalado. Un fallo de `start_node` se registra y el
/// nodo queda como estaba hasta el siguiente tick; no hay reintentos propios.
pub async fn scale<R>(registry: &R, scaler: &dyn Scaler) -> usize
where
    R: NodeRegistry + ?Sized,
{
    let mut started = 0;
    for node in registry.list_nodes().await {
        if !scaler.should_start_node(&node) {
            continue;
        }
        if let Err(e) = scaler.start_node(&node).await {
            warn!(node_id = %node.id, "no se pudo arrancar el nodo: {e:#}");
            continue;
        }
        match registry
            .set_node_state(&node.id, NodeState::Initializing, node.version)
            .await
        {
            Ok(_) => {
                info!(node_id = %node.id, "nodo arrancado");
                started += 1;
            }
            Err(e) => debug!(node_id = %node.id, "nodo arrancado pero no actualizado: {e}"),
        }
    }
    started
}
