use crate::util::Error;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use nodeforge_types::MachinePool;
use std::collections::BTreeMap;

use super::selector::node_matches_pool;

/// Nodes matched by two or more pools. A node in the overlap set could be
/// handed contradictory desired revisions, so callers must strip these nodes
/// before any mutating action.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverlapResult {
    /// node name -> sorted names of every pool matching it (len >= 2 only).
    node_to_pools: BTreeMap<String, Vec<String>>,
}

pub fn detect_overlap(pools: &[MachinePool], nodes: &[Node]) -> Result<OverlapResult, Error> {
    let mut node_to_pools: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes {
        let mut matching = Vec::new();
        for pool in pools {
            if node_matches_pool(node, pool)? {
                matching.push(pool.name_any());
            }
        }
        if matching.len() >= 2 {
            matching.sort();
            node_to_pools.insert(node.name_any(), matching);
        }
    }
    Ok(OverlapResult { node_to_pools })
}

impl OverlapResult {
    pub fn has_conflicts(&self) -> bool {
        !self.node_to_pools.is_empty()
    }

    pub fn conflict_count(&self) -> usize {
        self.node_to_pools.len()
    }

    pub fn is_node_conflicting(&self, node: &str) -> bool {
        self.node_to_pools.contains_key(node)
    }

    pub fn pools_for_node(&self, node: &str) -> &[String] {
        self.node_to_pools
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Conflicting node names involving the given pool, sorted.
    pub fn conflicts_for_pool(&self, pool: &str) -> Vec<&str> {
        self.node_to_pools
            .iter()
            .filter(|(_, pools)| pools.iter().any(|p| p == pool))
            .map(|(node, _)| node.as_str())
            .collect()
    }

    pub fn all_conflicting_pools(&self) -> Vec<String> {
        let mut pools: Vec<String> = self
            .node_to_pools
            .values()
            .flatten()
            .cloned()
            .collect();
        pools.sort();
        pools.dedup();
        pools
    }
}

/// Strips conflicting nodes from a selection. Every mutating path goes
/// through this first.
pub fn filter_non_conflicting(nodes: Vec<Node>, overlap: &OverlapResult) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|n| !overlap.is_node_conflicting(&n.name_any()))
        .collect()
}
