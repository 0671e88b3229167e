use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use nodeforge_common::annotations;
use nodeforge_types::MachinePool;

use crate::nodes::{self, update::should_uncordon};

/// Resolves the pool's maxUnavailable against the current node count.
/// Unset or invalid values fall back to 1; integers are taken as-is even
/// when they exceed the node count (the pool is effectively unthrottled).
pub fn calculate_max_unavailable(value: Option<&IntOrString>, node_count: usize) -> usize {
    match value {
        None => 1,
        Some(IntOrString::Int(i)) if *i >= 1 => *i as usize,
        Some(IntOrString::Int(_)) => 1,
        Some(IntOrString::String(s)) => match s
            .strip_suffix('%')
            .and_then(|p| p.trim().parse::<u64>().ok())
        {
            Some(percent) => {
                let count = node_count as u64;
                (((count * percent) + 99) / 100).max(1) as usize
            }
            None => 1,
        },
    }
}

/// Whether the node consumes rollout budget. Paused nodes never do: they sit
/// outside the rollout entirely, whatever state their host is in.
pub fn is_node_unavailable(node: &Node) -> bool {
    if nodes::is_paused(node) {
        return false;
    }
    if nodes::is_unschedulable(node) || nodes::is_cordoned_by_us(node) {
        return true;
    }
    if nodes::drain_started_at(node).is_some() {
        return true;
    }
    if matches!(
        nodes::agent_state(node),
        Some(annotations::AgentState::Applying) | Some(annotations::AgentState::Rebooting)
    ) {
        return true;
    }
    annotations::needs_update(node.annotations())
}

/// Total order for rollouts: zone (nodes without a zone last), creation
/// time, then name. A retry over unchanged inputs picks the same batch.
pub fn sort_nodes_for_update(nodes: &mut [Node]) {
    nodes.sort_by_key(|n| {
        (
            nodes_key_zone(n).is_none(),
            nodes_key_zone(n).map(str::to_string),
            n.metadata.creation_timestamp.clone().map(|t| t.0),
            n.name_any(),
        )
    });
}

fn nodes_key_zone(node: &Node) -> Option<&str> {
    nodes::zone(node)
}

/// Picks the nodes to start updating this reconcile, bounded by whatever
/// budget the already-unavailable nodes have left.
pub fn select_nodes_for_update(
    pool: &MachinePool,
    all_nodes: &[Node],
    target_revision: &str,
) -> Vec<Node> {
    let mut candidates: Vec<Node> = all_nodes
        .iter()
        .filter(|n| !nodes::is_paused(n))
        .filter(|n| !is_node_unavailable(n))
        .filter(|n| nodes::current_revision(n) != Some(target_revision))
        .cloned()
        .collect();
    sort_nodes_for_update(&mut candidates);

    let max_unavailable = calculate_max_unavailable(
        pool.spec.rollout.max_unavailable.as_ref(),
        all_nodes.len(),
    );
    let unavailable = all_nodes.iter().filter(|n| is_node_unavailable(n)).count();
    let budget = max_unavailable.saturating_sub(unavailable);
    candidates.truncate(budget.min(candidates.len()));
    candidates
}

/// Nodes already mid-rollout. These are re-driven on every reconcile until
/// they settle, independent of the budget.
pub fn collect_nodes_in_progress(all_nodes: &[Node], target_revision: &str) -> Vec<Node> {
    all_nodes
        .iter()
        .filter(|n| !nodes::is_paused(n))
        .filter(|n| is_node_unavailable(n))
        .filter(|n| {
            nodes::current_revision(n) != Some(target_revision)
                || should_uncordon(n, target_revision)
        })
        .cloned()
        .collect()
}
