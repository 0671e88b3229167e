use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, ResourceExt,
    api::{DeleteParams, EvictParams, ListParams},
    client::Client,
};
use std::time::Duration;

use super::{cordon, rules::DrainRuleSet};
use crate::util::{Error, is_disruption_blocked, is_not_found};

/// Kubelet-managed static pods carry this annotation; evicting them is
/// meaningless because the kubelet recreates them immediately.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Fallback self-identification when the controller's namespace is not
/// enough (e.g. a debug copy running elsewhere).
const SELF_PROTECT_LABEL_KEY: &str = "app.kubernetes.io/part-of";
const SELF_PROTECT_LABEL_VALUE: &str = "nodeforge";

const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 3600;
const MIN_RETRY_SECS: u64 = 10;

#[derive(Clone, Copy, Debug)]
pub struct DrainOptions {
    /// Negative means "use each pod's own terminationGracePeriodSeconds".
    pub grace_period_seconds: i64,
    pub ignore_daemon_sets: bool,
    /// Evict pods with no controller. When false they pin the drain.
    pub delete_orphans: bool,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            grace_period_seconds: -1,
            ignore_daemon_sets: true,
            delete_orphans: true,
        }
    }
}

/// Whether this drain call got every remaining pod moving.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// True if this call stamped the drain start, i.e. the drain just began.
    pub started: bool,
    pub evicted: usize,
    pub failures: Vec<Error>,
}

impl DrainReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_message(&self, node: &str) -> String {
        let summary = Error::DrainIncomplete {
            node: node.to_string(),
            evicted: self.evicted,
            failed: self.failures.len(),
        };
        format!(
            "{} ({})",
            summary,
            self.failures
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

pub fn is_pod_evictable(
    pod: &Pod,
    opts: &DrainOptions,
    rules: Option<&DrainRuleSet>,
    controller_namespace: &str,
) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    if matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    ) {
        return false;
    }
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return false;
    }
    let controller_owner = pod
        .metadata
        .owner_references
        .as_ref()
        .into_iter()
        .flatten()
        .find(|r| r.controller == Some(true));
    if opts.ignore_daemon_sets
        && controller_owner.is_some_and(|r| r.kind == "DaemonSet")
    {
        return false;
    }
    // Self-protection is unconditional: the controller must never evict
    // itself, whatever the ruleset says.
    if pod.namespace().as_deref() == Some(controller_namespace) {
        return false;
    }
    if pod.labels().get(SELF_PROTECT_LABEL_KEY).map(String::as_str)
        == Some(SELF_PROTECT_LABEL_VALUE)
    {
        return false;
    }
    if !opts.delete_orphans && controller_owner.is_none() {
        return false;
    }
    if let Some(rules) = rules
        && rules.should_skip_pod(pod).0
    {
        return false;
    }
    true
}

pub fn filter_evictable<'a>(
    pods: &'a [Pod],
    opts: &DrainOptions,
    rules: Option<&DrainRuleSet>,
    controller_namespace: &str,
) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|pod| is_pod_evictable(pod, opts, rules, controller_namespace))
        .collect()
}

pub async fn list_pods_on_node(client: Client, node_name: &str) -> Result<Vec<Pod>, Error> {
    let api: Api<Pod> = Api::all(client);
    let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
    Ok(api.list(&params).await?.items)
}

pub async fn is_drain_complete(
    client: Client,
    node_name: &str,
    opts: &DrainOptions,
    rules: Option<&DrainRuleSet>,
    controller_namespace: &str,
) -> Result<bool, Error> {
    let pods = list_pods_on_node(client, node_name).await?;
    Ok(filter_evictable(&pods, opts, rules, controller_namespace).is_empty())
}

/// One pass of the eviction loop: stamp the start, evict everything still
/// evictable, tally the stragglers. Disruption-budget refusals and races
/// with pods exiting on their own are expected and non-fatal.
pub async fn drain_node(
    client: Client,
    node: &Node,
    opts: &DrainOptions,
    rules: Option<&DrainRuleSet>,
    controller_namespace: &str,
    now: DateTime<Utc>,
) -> Result<DrainReport, Error> {
    let node_name = node.name_any();
    let started = cordon::stamp_drain_started(client.clone(), &node_name, now).await?;

    let pods = list_pods_on_node(client.clone(), &node_name).await?;
    let evictable = filter_evictable(&pods, opts, rules, controller_namespace);

    let mut report = DrainReport {
        started,
        ..Default::default()
    };
    for pod in evictable {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        match evict_pod(&api, &name, opts.grace_period_seconds).await {
            Ok(()) => report.evicted += 1,
            Err(e) => report.failures.push(e),
        }
    }
    Ok(report)
}

async fn evict_pod(api: &Api<Pod>, name: &str, grace_period_seconds: i64) -> Result<(), Error> {
    let delete_options = (grace_period_seconds >= 0).then(|| DeleteParams {
        grace_period_seconds: Some(grace_period_seconds as u32),
        ..Default::default()
    });
    let params = EvictParams {
        delete_options,
        ..Default::default()
    };
    match api.evict(name, &params).await {
        Ok(_) => Ok(()),
        // Already gone: the drain got what it wanted.
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) if is_disruption_blocked(&e) => Err(Error::DisruptionBlocked {
            pod: name.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainRetry {
    pub requeue_after: Duration,
    pub set_drain_stuck: bool,
}

/// Pure retry arithmetic; `handle_drain_retry` wraps it with the counter
/// bump.
pub fn compute_drain_retry(
    drain_started: Option<DateTime<Utc>>,
    timeout_seconds: u64,
    retry_seconds: u64,
    now: DateTime<Utc>,
) -> DrainRetry {
    let timeout = if timeout_seconds == 0 {
        DEFAULT_DRAIN_TIMEOUT_SECS
    } else {
        timeout_seconds
    };
    let retry_interval = if retry_seconds > 0 {
        retry_seconds
    } else {
        (timeout / 12).max(30)
    };
    let elapsed = drain_started
        .map(|t| (now - t).to_std().unwrap_or_default())
        .unwrap_or_default();
    if elapsed >= Duration::from_secs(timeout) {
        return DrainRetry {
            requeue_after: Duration::from_secs(retry_interval),
            set_drain_stuck: true,
        };
    }
    let remaining = Duration::from_secs(timeout) - elapsed;
    let requeue = remaining
        .min(Duration::from_secs(retry_interval))
        .max(Duration::from_secs(MIN_RETRY_SECS));
    DrainRetry {
        requeue_after: requeue,
        set_drain_stuck: false,
    }
}

pub async fn handle_drain_retry(
    client: Client,
    node: &Node,
    timeout_seconds: u64,
    retry_seconds: u64,
    now: DateTime<Utc>,
) -> Result<DrainRetry, Error> {
    cordon::increment_drain_retry(client, &node.name_any()).await?;
    Ok(compute_drain_retry(
        super::drain_started_at(node),
        timeout_seconds,
        retry_seconds,
        now,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use k8s_openapi::jiff::Timestamp;

    fn pod(namespace: &str, name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());
        pod
    }

    fn owned_by(mut pod: Pod, kind: &str) -> Pod {
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: "owner".to_string(),
            uid: "uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        pod
    }

    const CONTROLLER_NS: &str = "nodeforge-system";

    #[test]
    fn workload_pods_are_evictable() {
        let opts = DrainOptions::default();
        let p = owned_by(pod("default", "web-0"), "ReplicaSet");
        assert!(is_pod_evictable(&p, &opts, None, CONTROLLER_NS));
    }

    #[test]
    fn terminating_and_finished_pods_are_not() {
        let opts = DrainOptions::default();
        let mut terminating = owned_by(pod("default", "web-0"), "ReplicaSet");
        terminating.metadata.deletion_timestamp = Some(Time(Timestamp::from_second(1).unwrap()));
        assert!(!is_pod_evictable(&terminating, &opts, None, CONTROLLER_NS));

        let mut finished = owned_by(pod("default", "job-x"), "Job");
        finished.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(!is_pod_evictable(&finished, &opts, None, CONTROLLER_NS));
    }

    #[test]
    fn daemonsets_mirrors_and_orphans() {
        let opts = DrainOptions::default();
        let ds = owned_by(pod("default", "ds-x"), "DaemonSet");
        assert!(!is_pod_evictable(&ds, &opts, None, CONTROLLER_NS));
        let keep_ds = DrainOptions {
            ignore_daemon_sets: false,
            ..Default::default()
        };
        assert!(is_pod_evictable(&ds, &keep_ds, None, CONTROLLER_NS));

        let mut mirror = pod("kube-system", "etcd-node-1");
        mirror.metadata.annotations = Some(
            [(MIRROR_POD_ANNOTATION.to_string(), "hash".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!is_pod_evictable(&mirror, &opts, None, CONTROLLER_NS));

        let orphan = pod("default", "loner");
        assert!(is_pod_evictable(&orphan, &opts, None, CONTROLLER_NS));
        let no_orphans = DrainOptions {
            delete_orphans: false,
            ..Default::default()
        };
        assert!(!is_pod_evictable(&orphan, &no_orphans, None, CONTROLLER_NS));
    }

    #[test]
    fn the_controller_never_evicts_itself() {
        let opts = DrainOptions::default();
        let own_ns = owned_by(pod(CONTROLLER_NS, "operator-0"), "ReplicaSet");
        assert!(!is_pod_evictable(&own_ns, &opts, None, CONTROLLER_NS));

        let mut labeled = owned_by(pod("default", "stray-operator"), "ReplicaSet");
        labeled.metadata.labels = Some(
            [(
                SELF_PROTECT_LABEL_KEY.to_string(),
                SELF_PROTECT_LABEL_VALUE.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        assert!(!is_pod_evictable(&labeled, &opts, None, CONTROLLER_NS));

        // Even a match-everything ruleset cannot opt the controller back in,
        // but the point here is the inverse: rules cannot override the
        // namespace guard because it is checked first.
        assert!(!is_pod_evictable(&own_ns, &opts, Some(&DrainRuleSet::default()), CONTROLLER_NS));
    }

    #[test]
    fn exclusion_rules_apply_last() {
        use super::super::rules::{DrainRule, DrainRuleSet};
        let opts = DrainOptions::default();
        let rules = DrainRuleSet {
            rules: vec![DrainRule {
                namespaces: vec!["logging".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let excluded = owned_by(pod("logging", "fluentd-1"), "DaemonSet");
        let plain = owned_by(pod("default", "web-0"), "ReplicaSet");
        assert!(!is_pod_evictable(&excluded, &opts, Some(&rules), CONTROLLER_NS));
        assert!(is_pod_evictable(&plain, &opts, Some(&rules), CONTROLLER_NS));
    }

    #[test]
    fn retry_defaults_when_unconfigured() {
        let now = Utc::now();
        let started = now - TimeDelta::seconds(60);
        let retry = compute_drain_retry(Some(started), 0, 0, now);
        assert!(!retry.set_drain_stuck);
        // timeout defaults to 3600, retry interval to 3600/12 = 300
        assert_eq!(retry.requeue_after, Duration::from_secs(300));
    }

    #[test]
    fn retry_clamps_to_minimum() {
        let now = Utc::now();
        let started = now - TimeDelta::seconds(55);
        // 5s remaining of a 60s timeout, clamped up to 10s
        let retry = compute_drain_retry(Some(started), 60, 30, now);
        assert!(!retry.set_drain_stuck);
        assert_eq!(retry.requeue_after, Duration::from_secs(10));
    }

    #[test]
    fn timeout_flags_drain_stuck() {
        let now = Utc::now();
        let started = now - TimeDelta::seconds(70);
        let retry = compute_drain_retry(Some(started), 60, 15, now);
        assert!(retry.set_drain_stuck);
        assert_eq!(retry.requeue_after, Duration::from_secs(15));
    }

    #[test]
    fn short_retry_interval_derives_from_timeout() {
        let now = Utc::now();
        let started = now - TimeDelta::seconds(10);
        // 120/12 = 10 < 30 floor
        let retry = compute_drain_retry(Some(started), 120, 0, now);
        assert_eq!(retry.requeue_after, Duration::from_secs(30));
    }
}
