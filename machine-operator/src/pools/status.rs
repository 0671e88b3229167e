use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::jiff::Timestamp;
use kube::ResourceExt;
use nodeforge_common::annotations::{self, AgentState};
use nodeforge_types::{MachinePool, MachinePoolStatus};
use std::collections::HashMap;
use std::time::Duration;

use crate::nodes;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_UPDATING: &str = "Updating";
pub const CONDITION_DEGRADED: &str = "Degraded";
pub const CONDITION_DRAINING: &str = "Draining";
pub const CONDITION_DRAIN_STUCK: &str = "DrainStuck";
pub const CONDITION_POOL_OVERLAP: &str = "PoolOverlap";

pub const REASON_NODE_ERRORS: &str = "NodeErrors";
pub const REASON_RENDER_FAILED: &str = "RenderFailed";
pub const REASON_DRAIN_STUCK: &str = "DrainStuck";
pub const REASON_POOL_OVERLAP: &str = "PoolOverlap";

/// Condition types written by earlier releases; removed on sight so rolling
/// upgrades converge on the current set.
const LEGACY_CONDITIONS: &[&str] = &["Updated", "Progressing", "NodeDegraded", "RenderDegraded"];

const DEFAULT_APPLY_TIMEOUT_SECS: u64 = 600;

pub fn apply_timeout(pool: &MachinePool) -> Duration {
    let secs = pool.spec.rollout.apply_timeout_seconds;
    Duration::from_secs(if secs == 0 {
        DEFAULT_APPLY_TIMEOUT_SECS
    } else {
        secs
    })
}

/// One pass over the pool's nodes, reduced to counters and the revision
/// rollup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedStatus {
    pub machine: i32,
    pub ready: i32,
    pub updated: i32,
    pub updating: i32,
    pub degraded: i32,
    pub unavailable: i32,
    pub pending_reboot: i32,
    pub cordoned: i32,
    pub draining: i32,
    pub current_revision: String,
    pub timed_out_nodes: Vec<String>,
}

impl AggregatedStatus {
    /// The rollout is done: every node updated and ready, nothing degraded.
    pub fn is_complete(&self) -> bool {
        self.machine > 0
            && self.updated == self.machine
            && self.ready == self.machine
            && self.degraded == 0
    }
}

fn is_apply_timed_out(node: &Node, timeout: Duration, now: DateTime<Utc>) -> bool {
    if nodes::agent_state(node) != Some(AgentState::Applying) {
        return false;
    }
    let Some(set_at) =
        annotations::get_time(node.annotations(), annotations::DESIRED_REVISION_SET_AT)
    else {
        return false;
    };
    (now - set_at).to_std().unwrap_or_default() >= timeout
}

pub fn aggregate(
    nodes_list: &[Node],
    target_revision: &str,
    timeout: Duration,
    now: DateTime<Utc>,
) -> AggregatedStatus {
    let mut agg = AggregatedStatus::default();
    let mut revision_counts: HashMap<&str, usize> = HashMap::new();

    for node in nodes_list {
        agg.machine += 1;
        let state = nodes::agent_state(node);
        let updated = nodes::current_revision(node) == Some(target_revision);
        let timed_out = is_apply_timed_out(node, timeout, now);

        if updated {
            agg.updated += 1;
        }
        if updated && matches!(state, Some(AgentState::Done) | Some(AgentState::Idle)) {
            agg.ready += 1;
        }
        if state == Some(AgentState::Applying) && !timed_out {
            agg.updating += 1;
        }
        if state == Some(AgentState::Error) || timed_out {
            agg.degraded += 1;
        }
        if !matches!(state, Some(AgentState::Done) | Some(AgentState::Idle)) {
            agg.unavailable += 1;
        }
        if annotations::get_bool(node.annotations(), annotations::REBOOT_PENDING) {
            agg.pending_reboot += 1;
        }
        if nodes::is_cordoned_by_us(node) || nodes::is_unschedulable(node) {
            agg.cordoned += 1;
        }
        if nodes::drain_started_at(node).is_some() {
            agg.draining += 1;
        }
        if timed_out {
            agg.timed_out_nodes.push(node.name_any());
        }
        if let Some(rev) = nodes::current_revision(node)
            && !rev.is_empty()
        {
            *revision_counts.entry(rev).or_default() += 1;
        }
    }

    agg.timed_out_nodes.sort();
    agg.current_revision = rollup_current_revision(&revision_counts, target_revision);
    agg
}

/// Most common non-empty revision; ties prefer the target, then the
/// lexicographically first. No revisions at all reads as the target.
fn rollup_current_revision(counts: &HashMap<&str, usize>, target: &str) -> String {
    let Some(max) = counts.values().copied().max() else {
        return target.to_string();
    };
    let mut tied: Vec<&str> = counts
        .iter()
        .filter(|(_, n)| **n == max)
        .map(|(rev, _)| *rev)
        .collect();
    if tied.iter().any(|rev| *rev == target) {
        return target.to_string();
    }
    tied.sort();
    tied[0].to_string()
}

pub fn make_condition(type_: &str, active: bool, reason: &str, message: String) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if active { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Time(Timestamp::now()),
        observed_generation: None,
    }
}

/// The four conditions every pool carries after its first reconcile.
pub fn base_conditions(agg: &AggregatedStatus) -> Vec<Condition> {
    let ready = agg.machine > 0 && agg.updated == agg.machine;
    let updating = agg.updated < agg.machine && agg.degraded == 0;
    let degraded = agg.degraded > 0;
    let draining = agg.draining > 0;
    vec![
        make_condition(
            CONDITION_READY,
            ready,
            if ready { "AllNodesUpdated" } else { "RolloutIncomplete" },
            format!("{}/{} nodes at target revision", agg.updated, agg.machine),
        ),
        make_condition(
            CONDITION_UPDATING,
            updating,
            if updating { "RolloutProgressing" } else { "RolloutIdle" },
            format!("{} nodes updating", agg.updating),
        ),
        make_condition(
            CONDITION_DEGRADED,
            degraded,
            if degraded { REASON_NODE_ERRORS } else { "AsExpected" },
            if agg.timed_out_nodes.is_empty() {
                format!("{} nodes degraded", agg.degraded)
            } else {
                format!(
                    "{} nodes degraded (apply timed out on: {})",
                    agg.degraded,
                    agg.timed_out_nodes.join(", ")
                )
            },
        ),
        make_condition(
            CONDITION_DRAINING,
            draining,
            if draining { "NodesDraining" } else { "NoDrains" },
            format!("{} nodes draining", agg.draining),
        ),
    ]
}

/// Upserts one condition, keeping the old transition time when the status
/// did not flip.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        let last_transition_time = if existing.status == condition.status {
            existing.last_transition_time.clone()
        } else {
            condition.last_transition_time.clone()
        };
        *existing = Condition {
            last_transition_time,
            ..condition
        };
        return;
    }
    conditions.push(condition);
}

pub fn merge_conditions(conditions: &mut Vec<Condition>, incoming: Vec<Condition>) {
    for condition in incoming {
        set_condition(conditions, condition);
    }
}

pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == "True")
}

/// Pushes Degraded=True with the given reason, unless some other path
/// already holds it True (first writer wins within a reconcile).
pub fn push_degraded(conditions: &mut Vec<Condition>, reason: &str, message: String) {
    if is_condition_true(conditions, CONDITION_DEGRADED) {
        return;
    }
    set_condition(
        conditions,
        make_condition(CONDITION_DEGRADED, true, reason, message),
    );
}

/// Drops condition types written by earlier releases. Returns whether
/// anything was removed.
pub fn cleanup_legacy_conditions(status: &mut MachinePoolStatus) -> bool {
    let before = status.conditions.len();
    status
        .conditions
        .retain(|c| !LEGACY_CONDITIONS.contains(&c.type_.as_str()));
    status.conditions.len() != before
}

/// Copies an aggregation into the pool status and advances
/// lastSuccessfulRevision only on a fully clean pool.
pub fn apply_status_to_pool(
    status: &mut MachinePoolStatus,
    agg: &AggregatedStatus,
    target_revision: &str,
) {
    status.machine = agg.machine;
    status.ready = agg.ready;
    status.updated = agg.updated;
    status.updating = agg.updating;
    status.degraded = agg.degraded;
    status.unavailable = agg.unavailable;
    status.pending_reboot = agg.pending_reboot;
    status.cordoned = agg.cordoned;
    status.draining = agg.draining;
    status.target_revision = target_revision.to_string();
    status.current_revision = agg.current_revision.clone();
    merge_conditions(&mut status.conditions, base_conditions(agg));
    if agg.machine > 0
        && agg.updated == agg.machine
        && agg.degraded == 0
        && agg.pending_reboot == 0
    {
        status.last_successful_revision = target_revision.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_common::annotations as a;

    const TARGET: &str = "worker-ab12cd34ef";

    fn node(name: &str, annotations: &[(&str, &str)]) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node
    }

    fn settled(name: &str) -> Node {
        node(
            name,
            &[(a::CURRENT_REVISION, TARGET), (a::AGENT_STATE, "done")],
        )
    }

    #[test]
    fn clean_pool_counts_and_conditions() {
        let now = Utc::now();
        let agg = aggregate(
            &[settled("a"), settled("b")],
            TARGET,
            Duration::from_secs(600),
            now,
        );
        assert_eq!((agg.machine, agg.ready, agg.updated), (2, 2, 2));
        assert_eq!(agg.degraded, 0);
        assert_eq!(agg.unavailable, 0);
        assert_eq!(agg.current_revision, TARGET);
        assert!(agg.is_complete());

        let conditions = base_conditions(&agg);
        assert_eq!(conditions.len(), 4);
        assert!(is_condition_true(&conditions, CONDITION_READY));
        assert!(!is_condition_true(&conditions, CONDITION_UPDATING));
        assert!(!is_condition_true(&conditions, CONDITION_DEGRADED));
        assert!(!is_condition_true(&conditions, CONDITION_DRAINING));
    }

    #[test]
    fn mid_rollout_counts() {
        let now = Utc::now();
        let stamp = (now - chrono::TimeDelta::seconds(30)).to_rfc3339();
        let applying = node(
            "b",
            &[
                (a::CURRENT_REVISION, "worker-old1"),
                (a::AGENT_STATE, "applying"),
                (a::DESIRED_REVISION, TARGET),
                (a::DESIRED_REVISION_SET_AT, &stamp),
            ],
        );
        let draining = node(
            "c",
            &[
                (a::CORDONED, "true"),
                (a::DRAIN_STARTED_AT, "2026-01-01T00:00:00Z"),
            ],
        );
        let agg = aggregate(
            &[settled("a"), applying, draining],
            TARGET,
            Duration::from_secs(600),
            now,
        );
        assert_eq!(agg.machine, 3);
        assert_eq!(agg.updated, 1);
        assert_eq!(agg.updating, 1);
        assert_eq!(agg.degraded, 0);
        assert_eq!(agg.unavailable, 2);
        assert_eq!(agg.cordoned, 1);
        assert_eq!(agg.draining, 1);
        let conditions = base_conditions(&agg);
        assert!(is_condition_true(&conditions, CONDITION_UPDATING));
        assert!(is_condition_true(&conditions, CONDITION_DRAINING));
    }

    #[test]
    fn apply_timeout_degrades_the_node() {
        let now = Utc::now();
        let stale = (now - chrono::TimeDelta::seconds(700)).to_rfc3339();
        let stuck = node(
            "slow",
            &[
                (a::AGENT_STATE, "applying"),
                (a::DESIRED_REVISION, TARGET),
                (a::DESIRED_REVISION_SET_AT, &stale),
            ],
        );
        let agg = aggregate(&[stuck], TARGET, Duration::from_secs(600), now);
        assert_eq!(agg.updating, 0);
        assert_eq!(agg.degraded, 1);
        assert_eq!(agg.timed_out_nodes, ["slow"]);
        // Degraded wins over Updating.
        let conditions = base_conditions(&agg);
        assert!(is_condition_true(&conditions, CONDITION_DEGRADED));
        assert!(!is_condition_true(&conditions, CONDITION_UPDATING));
        assert_eq!(
            get_condition(&conditions, CONDITION_DEGRADED).unwrap().reason,
            REASON_NODE_ERRORS
        );
    }

    #[test]
    fn revision_rollup_prefers_target_on_ties() {
        let now = Utc::now();
        let nodes = [
            node("a", &[(a::CURRENT_REVISION, TARGET)]),
            node("b", &[(a::CURRENT_REVISION, "worker-old1")]),
        ];
        let agg = aggregate(&nodes, TARGET, Duration::from_secs(600), now);
        assert_eq!(agg.current_revision, TARGET);

        let nodes = [
            node("a", &[(a::CURRENT_REVISION, "worker-bbb")]),
            node("b", &[(a::CURRENT_REVISION, "worker-aaa")]),
        ];
        let agg = aggregate(&nodes, TARGET, Duration::from_secs(600), now);
        assert_eq!(agg.current_revision, "worker-aaa");

        let agg = aggregate(&[node("bare", &[])], TARGET, Duration::from_secs(600), now);
        assert_eq!(agg.current_revision, TARGET);
    }

    #[test]
    fn majority_revision_wins() {
        let now = Utc::now();
        let nodes = [
            node("a", &[(a::CURRENT_REVISION, "worker-old1")]),
            node("b", &[(a::CURRENT_REVISION, "worker-old1")]),
            node("c", &[(a::CURRENT_REVISION, TARGET)]),
        ];
        let agg = aggregate(&nodes, TARGET, Duration::from_secs(600), now);
        assert_eq!(agg.current_revision, "worker-old1");
    }

    #[test]
    fn transition_time_survives_unchanged_status() {
        let mut conditions = Vec::new();
        let mut first = make_condition(CONDITION_READY, true, "AllNodesUpdated", "2/2".into());
        first.last_transition_time = Time(Timestamp::from_second(1000).unwrap());
        set_condition(&mut conditions, first);

        set_condition(
            &mut conditions,
            make_condition(CONDITION_READY, true, "AllNodesUpdated", "3/3".into()),
        );
        let ready = get_condition(&conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.last_transition_time.0, Timestamp::from_second(1000).unwrap());
        assert_eq!(ready.message, "3/3");

        // A status flip moves the transition time.
        set_condition(
            &mut conditions,
            make_condition(CONDITION_READY, false, "RolloutIncomplete", "2/3".into()),
        );
        let ready = get_condition(&conditions, CONDITION_READY).unwrap();
        assert_ne!(ready.last_transition_time.0, Timestamp::from_second(1000).unwrap());
        assert_eq!(ready.status, "False");
    }

    #[test]
    fn degraded_channel_does_not_override_existing_true() {
        let mut conditions = vec![make_condition(
            CONDITION_DEGRADED,
            true,
            REASON_NODE_ERRORS,
            "1 nodes degraded".into(),
        )];
        push_degraded(&mut conditions, REASON_RENDER_FAILED, "collision".into());
        assert_eq!(
            get_condition(&conditions, CONDITION_DEGRADED).unwrap().reason,
            REASON_NODE_ERRORS
        );

        let mut clean = Vec::new();
        push_degraded(&mut clean, REASON_RENDER_FAILED, "collision".into());
        assert_eq!(
            get_condition(&clean, CONDITION_DEGRADED).unwrap().reason,
            REASON_RENDER_FAILED
        );
    }

    #[test]
    fn overlap_alone_degrades_the_pool() {
        // An otherwise healthy pool with a contested node.
        let agg = AggregatedStatus {
            machine: 1,
            ready: 1,
            updated: 1,
            ..Default::default()
        };
        let mut conditions = base_conditions(&agg);
        assert!(!is_condition_true(&conditions, CONDITION_DEGRADED));
        push_degraded(
            &mut conditions,
            REASON_POOL_OVERLAP,
            "nodes matched by multiple pools: node-x".into(),
        );
        assert!(is_condition_true(&conditions, CONDITION_DEGRADED));
        assert_eq!(
            get_condition(&conditions, CONDITION_DEGRADED).unwrap().reason,
            REASON_POOL_OVERLAP
        );
    }

    #[test]
    fn legacy_conditions_are_dropped() {
        let mut status = MachinePoolStatus {
            conditions: vec![
                make_condition("Progressing", true, "Legacy", String::new()),
                make_condition(CONDITION_READY, true, "AllNodesUpdated", String::new()),
            ],
            ..Default::default()
        };
        assert!(cleanup_legacy_conditions(&mut status));
        assert_eq!(status.conditions.len(), 1);
        assert!(!cleanup_legacy_conditions(&mut status));
    }

    #[test]
    fn last_successful_revision_is_monotonic_on_clean_pools() {
        let now = Utc::now();
        let mut status = MachinePoolStatus {
            last_successful_revision: "worker-old1".to_string(),
            ..Default::default()
        };
        // Degraded pool: untouched.
        let degraded_node = node("x", &[(a::AGENT_STATE, "error"), (a::CURRENT_REVISION, TARGET)]);
        let agg = aggregate(&[degraded_node], TARGET, Duration::from_secs(600), now);
        apply_status_to_pool(&mut status, &agg, TARGET);
        assert_eq!(status.last_successful_revision, "worker-old1");

        // Clean pool: advances.
        let agg = aggregate(&[settled("a")], TARGET, Duration::from_secs(600), now);
        apply_status_to_pool(&mut status, &agg, TARGET);
        assert_eq!(status.last_successful_revision, TARGET);

        // Pending reboot blocks it.
        let rebooting = node(
            "a",
            &[
                (a::CURRENT_REVISION, "worker-new99"),
                (a::AGENT_STATE, "done"),
                (a::REBOOT_PENDING, "true"),
            ],
        );
        let agg = aggregate(&[rebooting], "worker-new99", Duration::from_secs(600), now);
        apply_status_to_pool(&mut status, &agg, "worker-new99");
        assert_eq!(status.last_successful_revision, TARGET);
    }
}
