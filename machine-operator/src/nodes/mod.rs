pub mod cordon;
pub mod drain;
pub mod rules;
pub mod update;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use nodeforge_common::annotations::{self, AgentState};

/// Standard topology label consulted for rollout ordering.
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

pub fn desired_revision(node: &Node) -> Option<&str> {
    annotations::get_str(node.annotations(), annotations::DESIRED_REVISION)
}

pub fn current_revision(node: &Node) -> Option<&str> {
    annotations::get_str(node.annotations(), annotations::CURRENT_REVISION)
}

pub fn agent_state(node: &Node) -> Option<AgentState> {
    annotations::agent_state(node.annotations())
}

pub fn is_paused(node: &Node) -> bool {
    annotations::is_node_paused(node.annotations())
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Cordoned by this controller, as opposed to a manual `kubectl cordon`.
pub fn is_cordoned_by_us(node: &Node) -> bool {
    annotations::get_bool(node.annotations(), annotations::CORDONED)
}

pub fn drain_started_at(node: &Node) -> Option<DateTime<Utc>> {
    annotations::get_time(node.annotations(), annotations::DRAIN_STARTED_AT)
}

pub fn zone(node: &Node) -> Option<&str> {
    node.labels().get(ZONE_LABEL).map(String::as_str)
}
