//! Puntuación de candidatos. Cada score devuelve un valor en [0, 1];
//! gana la media ponderada más baja y el empate se rompe por id de nodo.

use std::collections::BTreeMap;

use common::{Node, NodeState, Task};

pub type Score = fn(&Task, &Node) -> f64;

/// Hueco que queda tras colocar la tarea (cpu y ram); más justo = mejor.
pub fn resource_fit(task: &Task, node: &Node) -> f64 {
    let req = task.requested();
    let cpu = leftover(
        f64::from(node.available.cpus) - f64::from(req.cpu_cores.max(0)),
        f64::from(node.resources.cpus),
    );
    let ram = leftover(node.available.ram_gb - req.ram_gb, node.resources.ram_gb);
    (cpu + ram) / 2.0
}

fn leftover(free: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        (free / total).clamp(0.0, 1.0)
    }
}

/// Un nodo que aún no está ALIVE tarda en arrancar.
pub fn startup_cost(_task: &Task, node: &Node) -> f64 {
    match node.state {
        NodeState::Alive => 0.0,
        _ => 1.0,
    }
}

/// Nodos con menos tareas en marcha primero.
pub fn active_tasks(_task: &Task, node: &Node) -> f64 {
    let n = node.task_ids.len() as f64;
    n / (n + 1.0)
}

pub fn defaults() -> Vec<(&'static str, Score)> {
    vec![
        ("resource_fit", resource_fit as Score),
        ("startup_cost", startup_cost as Score),
        ("active_tasks", active_tasks as Score),
    ]
}

/// Media ponderada; un score sin peso configurado pesa 1.
pub fn weighted(
    scores: &[(&'static str, Score)],
    weights: &BTreeMap<String, f64>,
    task: &Task,
    node: &Node,
) -> f64 {
    let (mut sum, mut total) = (0.0, 0.0);
    for (name, f) in scores {
        let w = weights.get(*name).copied().unwrap_or(1.0).max(0.0);
        sum += w * f(task, node);
        total += w;
    }
    if total == 0.0 {
        0.0
    } else {
        sum / total
    }
}

/// Mejor candidato: menor score, después menor id.
pub fn pick<'a>(
    scores: &[(&'static str, Score)],
    weights: &BTreeMap<String, f64>,
    task: &Task,
    candidates: impl IntoIterator<Item = &'a Node>,
) -> Option<&'a Node> {
    candidates
        .into_iter()
        .map(|n| (weighted(scores, weights, task, n), n))
        .min_by(|(sa, a), (sb, b)| sa.total_cmp(sb).then_with(|| a.id.cmp(&b.id)))
        .map(|(_, n)| n)
}
