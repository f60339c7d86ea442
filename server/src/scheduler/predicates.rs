//! Filtros (tarea, nodo): un nodo es candidato si pasa todos.

use std::sync::Arc;

use common::{Node, Task};

pub type Predicate = Arc<dyn Fn(&Task, &Node) -> bool + Send + Sync>;

/// Recursos disponibles suficientes; un nodo preemptible solo acepta
/// tareas que lo permitan.
pub fn resources_fit(task: &Task, node: &Node) -> bool {
    let req = task.requested();
    if node.preemptible && !req.preemptible {
        return false;
    }
    i64::from(node.available.cpus) >= i64::from(req.cpu_cores)
        && node.available.ram_gb >= req.ram_gb
        && node.available.disk_gb >= req.disk_gb
}

/// Ningún puerto host pedido (distinto de 0) está ya ocupado en el nodo.
pub fn ports_fit(task: &Task, node: &Node) -> bool {
    task.executors
        .iter()
        .flat_map(|e| e.host_ports())
        .all(|p| !node.active_ports.contains(&p))
}

pub fn zones_fit(task: &Task, node: &Node) -> bool {
    let zones = task.requested().zones;
    if zones.is_empty() || node.zone.is_empty() {
        return true;
    }
    zones.iter().any(|z| *z == node.zone)
}

pub fn not_dead(_task: &Task, node: &Node) -> bool {
    !node.is_dead()
}

/// El nodo tiene la etiqueta `key`; si la tarea pide un valor, debe coincidir.
pub fn node_has_tag(key: impl Into<String>) -> Predicate {
    let key = key.into();
    Arc::new(move |task: &Task, node: &Node| match node.metadata.get(&key) {
        None => false,
        Some(have) => match task.tags.get(&key) {
            Some(want) if !want.is_empty() => want == have,
            _ => true,
        },
    })
}

pub fn defaults() -> Vec<Predicate> {
    vec![
        Arc::new(resources_fit) as Predicate,
        Arc::new(ports_fit) as Predicate,
        Arc::new(zones_fit) as Predicate,
        Arc::new(not_dead) as Predicate,
    ]
}

pub fn all_match(preds: &[Predicate], task: &Task, node: &Node) -> bool {
    preds.iter().all(|p| p(task, node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::node::Resources as NodeResources;
    use common::{Executor, NodeState, Ports, Resources};
    use rstest::rstest;

    fn node() -> Node {
        Node {
            id: "n1".into(),
            state: NodeState::Alive,
            resources: NodeResources { cpus: 16, ram_gb: 64.0, disk_gb: 500.0 },
            available: NodeResources { cpus: 8, ram_gb: 32.0, disk_gb: 100.0 },
            active_ports: vec![8080],
            zone: "us-east1-b".into(),
            ..Default::default()
        }
    }

    fn task(cpus: i32, ram: f64, disk: f64) -> Task {
        Task {
            resources: Some(Resources {
                cpu_cores: cpus,
                ram_gb: ram,
                disk_gb: disk,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[rstest]
    #[case::empty(task(0, 0.0, 0.0), true)]
    #[case::exact(task(8, 32.0, 100.0), true)]
    #[case::too_many_cpus(task(9, 1.0, 1.0), false)]
    #[case::too_much_ram(task(1, 33.0, 1.0), false)]
    #[case::too_much_disk(task(1, 1.0, 101.0), false)]
    #[case::oversized(task(1000, 0.0, 0.0), false)]
    fn resources(#[case] t: Task, #[case] fits: bool) {
        assert_eq!(resources_fit(&t, &node()), fits);
    }

    #[test]
    fn preemptible_node_needs_preemptible_task() {
        let mut n = node();
        n.preemptible = true;
        let mut t = task(1, 1.0, 1.0);
        assert!(!resources_fit(&t, &n));
        if let Some(r) = t.resources.as_mut() {
            r.preemptible = true;
        }
        assert!(resources_fit(&t, &n));
    }

    #[rstest]
    #[case::random_port(0, true)]
    #[case::free_port(9000, true)]
    #[case::taken_port(8080, false)]
    fn ports(#[case] host: u32, #[case] fits: bool) {
        let t = Task {
            executors: vec![Executor {
                ports: vec![Ports { container: 80, host }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(ports_fit(&t, &node()), fits);
    }

    #[test]
    fn zones_and_liveness() {
        let mut t = task(0, 0.0, 0.0);
        assert!(zones_fit(&t, &node()));
        if let Some(r) = t.resources.as_mut() {
            r.zones = vec!["eu-west1".into()];
        }
        assert!(!zones_fit(&t, &node()));

        let mut n = node();
        n.state = NodeState::Dead;
        assert!(!not_dead(&t, &n));
        assert!(!all_match(&defaults(), &task(0, 0.0, 0.0), &n));
    }

    #[test]
    fn tag_routing() {
        let pred = node_has_tag("gpu");
        let mut n = node();
        let mut t = task(0, 0.0, 0.0);
        assert!(!pred(&t, &n));
        n.metadata.insert("gpu".into(), "a100".into());
        assert!(pred(&t, &n));
        t.tags.insert("gpu".into(), "v100".into());
        assert!(!pred(&t, &n));
    }
}
