use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::{ResourceExt, client::Client};
use std::time::Duration;

use super::{
    cordon, current_revision, desired_revision, drain, drain_started_at, is_cordoned_by_us,
    is_unschedulable, rules::DrainRuleSet,
};
use crate::util::Error;

/// A node is ready to rejoin scheduling once the agent reports the target
/// revision. Agent state is deliberately ignored: when the host already
/// matches the target the agent may legitimately stay idle forever.
pub fn should_uncordon(node: &Node, target_revision: &str) -> bool {
    is_cordoned_by_us(node) && current_revision(node) == Some(target_revision)
}

/// What `process_node_update` decided to do for one node, and what the
/// reconciler should surface about it.
#[derive(Debug, Default)]
pub struct NodeUpdateOutcome {
    pub requeue_after: Option<Duration>,
    pub cordoned: bool,
    pub drain_started: bool,
    pub drain_complete: bool,
    pub uncordoned: bool,
    pub drain_stuck: bool,
    pub drain_stuck_message: String,
    pub drain_failed: bool,
    pub drain_failed_message: String,
    /// Set at uncordon when a drain had been started; recorded by the caller.
    pub drain_duration: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStep {
    /// Already at target and schedulable; nothing to do.
    Terminal,
    Cordon,
    Uncordon,
    Drain,
    AssignRevision,
    AwaitAgent,
}

/// The transitions decidable from annotations alone. Returns None when the
/// answer depends on whether evictable pods remain.
pub fn pre_drain_step(node: &Node, target_revision: &str) -> Option<NodeStep> {
    if should_uncordon(node, target_revision) {
        return Some(NodeStep::Uncordon);
    }
    if current_revision(node) == Some(target_revision)
        && !is_cordoned_by_us(node)
        && !is_unschedulable(node)
    {
        return Some(NodeStep::Terminal);
    }
    if !is_cordoned_by_us(node) || !is_unschedulable(node) {
        return Some(NodeStep::Cordon);
    }
    None
}

/// Resolves the remaining transitions once pod state is known. A node never
/// advances past draining while an evictable pod remains; that is the
/// guarantee that it cannot reboot under live workloads.
pub fn post_drain_step(node: &Node, target_revision: &str, drain_complete: bool) -> NodeStep {
    if !drain_complete {
        return NodeStep::Drain;
    }
    if desired_revision(node) != Some(target_revision) {
        return NodeStep::AssignRevision;
    }
    NodeStep::AwaitAgent
}

/// Advances one node a single step through
/// cordon -> drain -> assign-revision -> await-agent -> uncordon.
/// Identical observed state always produces identical effects; progress is
/// carried entirely by annotations.
#[allow(clippy::too_many_arguments)]
pub async fn process_node_update(
    client: Client,
    pool_name: &str,
    node: &Node,
    target_revision: &str,
    drain_timeout_seconds: u64,
    drain_retry_seconds: u64,
    drain_rules: Option<&DrainRuleSet>,
    controller_namespace: &str,
    now: DateTime<Utc>,
) -> Result<NodeUpdateOutcome, Error> {
    let name = node.name_any();
    let mut outcome = NodeUpdateOutcome::default();

    let step = match pre_drain_step(node, target_revision) {
        Some(step) => step,
        None => {
            let opts = drain::DrainOptions::default();
            let complete = drain::is_drain_complete(
                client.clone(),
                &name,
                &opts,
                drain_rules,
                controller_namespace,
            )
            .await?;
            post_drain_step(node, target_revision, complete)
        }
    };

    match step {
        NodeStep::Terminal => {
            // A manual uncordon can leave drain bookkeeping behind; sweep it.
            cordon::clear_drain_annotations(client, &name).await?;
        }
        NodeStep::Cordon => {
            cordon::cordon(client, &name).await?;
            outcome.cordoned = true;
            outcome.requeue_after = Some(Duration::from_secs(1));
        }
        NodeStep::Uncordon => {
            if let Some(started) = drain_started_at(node) {
                outcome.drain_duration = (now - started).to_std().ok();
            }
            cordon::uncordon(client, &name).await?;
            outcome.uncordoned = true;
        }
        NodeStep::Drain => {
            let opts = drain::DrainOptions::default();
            let report = drain::drain_node(
                client.clone(),
                node,
                &opts,
                drain_rules,
                controller_namespace,
                now,
            )
            .await?;
            outcome.drain_started = report.started;
            if report.ok() {
                // Evictions accepted, but pods may still be terminating (or
                // quietly respawning onto the cordoned node), so the
                // deadline is checked either way.
                let started_at = drain_started_at(node).unwrap_or(now);
                let retry = drain::compute_drain_retry(
                    Some(started_at),
                    drain_timeout_seconds,
                    drain_retry_seconds,
                    now,
                );
                if retry.set_drain_stuck {
                    outcome.drain_stuck = true;
                    outcome.drain_stuck_message = format!(
                        "drain of node '{}' has not completed within its timeout",
                        name
                    );
                    outcome.requeue_after = Some(retry.requeue_after);
                } else {
                    outcome.requeue_after = Some(Duration::from_secs(5));
                }
            } else {
                let retry = drain::handle_drain_retry(
                    client,
                    node,
                    drain_timeout_seconds,
                    drain_retry_seconds,
                    now,
                )
                .await?;
                outcome.drain_failed = true;
                outcome.drain_failed_message = report.failure_message(&name);
                if retry.set_drain_stuck {
                    outcome.drain_stuck = true;
                    outcome.drain_stuck_message = format!(
                        "drain of node '{}' has not completed within its timeout",
                        name
                    );
                }
                outcome.requeue_after = Some(retry.requeue_after);
            }
        }
        NodeStep::AssignRevision => {
            cordon::set_desired_revision_for_nodes(
                client,
                std::slice::from_ref(node),
                target_revision,
                pool_name,
                now,
            )
            .await?;
            outcome.drain_complete = drain_started_at(node).is_some();
            outcome.requeue_after = Some(Duration::from_secs(1));
        }
        NodeStep::AwaitAgent => {
            outcome.requeue_after = Some(Duration::from_secs(10));
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_common::annotations as a;

    const TARGET: &str = "worker-ab12cd34ef";

    fn node(annotations: &[(&str, &str)], unschedulable: bool) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some("node-1".to_string());
        node.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        if unschedulable {
            node.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            });
        }
        node
    }

    #[test]
    fn fresh_node_gets_cordoned() {
        let n = node(&[], false);
        assert_eq!(pre_drain_step(&n, TARGET), Some(NodeStep::Cordon));
    }

    #[test]
    fn half_cordoned_node_is_recordoned() {
        // Annotation present but someone uncordoned it manually.
        let n = node(&[(a::CORDONED, "true")], false);
        assert_eq!(pre_drain_step(&n, TARGET), Some(NodeStep::Cordon));
    }

    #[test]
    fn settled_node_is_uncordoned_regardless_of_agent_state() {
        let n = node(
            &[
                (a::CORDONED, "true"),
                (a::CURRENT_REVISION, TARGET),
                (a::AGENT_STATE, "idle"),
            ],
            true,
        );
        assert_eq!(pre_drain_step(&n, TARGET), Some(NodeStep::Uncordon));
        assert!(should_uncordon(&n, TARGET));
        // The same holds with no agent state at all.
        let n = node(&[(a::CORDONED, "true"), (a::CURRENT_REVISION, TARGET)], true);
        assert!(should_uncordon(&n, TARGET));
    }

    #[test]
    fn uncordon_ignores_nodes_we_did_not_cordon() {
        let n = node(&[(a::CURRENT_REVISION, TARGET)], true);
        assert!(!should_uncordon(&n, TARGET));
    }

    #[test]
    fn finished_node_is_terminal() {
        let n = node(&[(a::CURRENT_REVISION, TARGET)], false);
        assert_eq!(pre_drain_step(&n, TARGET), Some(NodeStep::Terminal));
    }

    #[test]
    fn cordoned_node_proceeds_to_drain_checks() {
        let n = node(&[(a::CORDONED, "true")], true);
        assert_eq!(pre_drain_step(&n, TARGET), None);
        assert_eq!(post_drain_step(&n, TARGET, false), NodeStep::Drain);
    }

    #[test]
    fn never_assigns_revision_while_pods_remain() {
        let n = node(&[(a::CORDONED, "true"), (a::DRAIN_STARTED_AT, "2026-01-01T00:00:00Z")], true);
        // Even with drain long started, an incomplete drain keeps draining.
        assert_eq!(post_drain_step(&n, TARGET, false), NodeStep::Drain);
        assert_eq!(post_drain_step(&n, TARGET, true), NodeStep::AssignRevision);
    }

    #[test]
    fn assigned_node_awaits_the_agent() {
        let n = node(
            &[
                (a::CORDONED, "true"),
                (a::DESIRED_REVISION, TARGET),
                (a::AGENT_STATE, "applying"),
            ],
            true,
        );
        assert_eq!(post_drain_step(&n, TARGET, true), NodeStep::AwaitAgent);
    }
}
