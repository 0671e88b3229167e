use chrono::Utc;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{
    Api, ResourceExt,
    client::Client,
    core::{Selector, SelectorExt},
    runtime::{
        Controller,
        controller::Action,
        reflector::ObjectRef,
        watcher,
    },
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use nodeforge_types::{HostConfig, MachinePool};
use owo_colors::OwoColorize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
    time::Instant,
};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{
    artifacts, debounce::DebounceTracker, overlap, rollout,
    selector::{self, parse_selector},
    status,
};
use crate::nodes::{cordon, rules, update};
use crate::util::{
    self, Error, PROBE_INTERVAL, events,
    colors::{FG1, FG2},
    is_not_found,
    patch::{patch_pool_status_with_retry, patch_status},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `MachinePool` controller.
pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting MachinePool controller...".green());

    // Preparation of resources used by the `kube_runtime::Controller`
    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    // Namespace where we run leader election.
    // This lets us keep the Lease RBAC namespaced rather than cluster-scoped.
    let lease_namespace = util::controller_namespace();
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("nodeforge-pool-controller-{}", uuid::Uuid::new_v4()));
    // The shared lock name across all replicas
    let lease_name = "nodeforge-pool-controller-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        nodeforge_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    nodeforge_common::signal_ready();
    println!("{}", "🌱 Standing by for leadership...".green());
    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 MachinePool controller started.".green());
                    run_controller(client_for_controller, context_for_controller).await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// Wires the watch fan-in: pool edits reconcile directly, artifact changes
/// map through ownership, and config / node / drain-rule changes map back
/// to pools through the selector registry.
async fn run_controller(client: Client, context: Arc<ContextData>) {
    let pools: Api<MachinePool> = Api::all(client.clone());
    let configs: Api<HostConfig> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let rendered: Api<nodeforge_types::RenderedHostConfig> = Api::all(client.clone());
    let drain_rules: Api<ConfigMap> =
        Api::namespaced(client.clone(), &rules::drain_rules_namespace());

    let config_registry = context.registry.clone();
    let node_registry = context.registry.clone();
    let stuck_registry = context.registry.clone();

    Controller::new(pools, Default::default())
        .owns(rendered, Default::default())
        .watches(configs, watcher::Config::default(), move |config: HostConfig| {
            pools_matching(&config_registry, config.labels(), |entry| {
                &entry.config_selector
            })
        })
        .watches(nodes, watcher::Config::default(), move |node: Node| {
            pools_matching(&node_registry, node.labels(), |entry| &entry.node_selector)
        })
        .watches(
            drain_rules,
            watcher::Config::default().labels(rules::DRAIN_RULES_LABEL),
            move |_cm: ConfigMap| {
                // A rule edit only matters to pools wedged on a drain; waking
                // the healthy ones would be pure churn.
                let registry = stuck_registry.read().unwrap();
                registry
                    .iter()
                    .filter(|(_, entry)| entry.drain_stuck)
                    .map(|(name, _)| ObjectRef::new(name))
                    .collect::<Vec<_>>()
            },
        )
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
}

fn pools_matching(
    registry: &Arc<RwLock<HashMap<String, PoolWatchEntry>>>,
    labels: &BTreeMap<String, String>,
    which: fn(&PoolWatchEntry) -> &Option<Selector>,
) -> Vec<ObjectRef<MachinePool>> {
    let registry = registry.read().unwrap();
    registry
        .iter()
        .filter(|(_, entry)| {
            which(entry)
                .as_ref()
                .is_none_or(|selector| selector.matches(labels))
        })
        .map(|(name, _)| ObjectRef::new(name))
        .collect()
}

/// What the watch mappers need to know about each live pool. Refreshed on
/// every reconcile; an empty registry right after startup is harmless since
/// the controller lists all pools anyway.
#[derive(Clone, Debug, Default)]
pub struct PoolWatchEntry {
    node_selector: Option<Selector>,
    config_selector: Option<Selector>,
    drain_stuck: bool,
    has_overlap: bool,
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with. Required for K8S resource management.
    client: Client,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    debounce: DebounceTracker,
    events: events::EventSink,
    registry: Arc<RwLock<HashMap<String, PoolWatchEntry>>>,
    last_outcome: Mutex<HashMap<String, (String, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client) -> Self {
        ContextData {
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new("pools"),
            debounce: DebounceTracker::new(),
            events: events::EventSink::new(client.clone()),
            registry: Arc::new(RwLock::new(HashMap::new())),
            last_outcome: Mutex::new(HashMap::new()),
            client,
        }
    }
}

/// Reconciliation function for the `MachinePool` resource.
async fn reconcile(instance: Arc<MachinePool>, context: Arc<ContextData>) -> Result<Action, Error> {
    // The `Client` is shared -> a clone from the reference is obtained
    let client: Client = context.client.clone();
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    let read_start = std::time::Instant::now();

    // The cached object may lag the store; reconcile against a fresh read.
    let api: Api<MachinePool> = Api::all(client.clone());
    let pool = match api.get(&name).await {
        Ok(pool) => pool,
        Err(e) if is_not_found(&e) => {
            forget_pool(&context, &name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };
    if pool.metadata.deletion_timestamp.is_some() {
        // Artifacts go with the pool through ownership; local state goes now.
        forget_pool(&context, &name);
        return Ok(Action::await_change());
    }

    // Migration: drop condition types from earlier releases.
    let mut migrated = pool.status.clone().unwrap_or_default();
    if status::cleanup_legacy_conditions(&mut migrated) {
        let conditions = migrated.conditions.clone();
        patch_status(client.clone(), &pool, move |s: &mut nodeforge_types::MachinePoolStatus| {
            s.conditions = conditions;
        })
        .await?;
    }

    // Selector problems are permanent until the spec is edited; log and wait
    // for that edit rather than requeuing into the same failure.
    let parsed_selectors = (
        pool.spec.node_selector.as_ref().map(parse_selector).transpose(),
        pool.spec.config_selector.as_ref().map(parse_selector).transpose(),
    );
    let (node_selector, config_selector) = match parsed_selectors {
        (Ok(n), Ok(c)) => (n, c),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!(
                "{}",
                format!("pool '{}' has an invalid selector: {}", name, e).red()
            );
            return Ok(Action::await_change());
        }
    };
    update_registry(&context, &name, |entry| {
        entry.node_selector = node_selector.clone();
        entry.config_selector = config_selector.clone();
    });

    if pool.spec.paused {
        return Ok(Action::requeue(PROBE_INTERVAL));
    }

    // Overlap detection runs over every pool so any reconcile notices a
    // newly contested node, whichever pool's watch fired.
    let all_pools = api.list(&Default::default()).await?.items;
    let nodes_api: Api<Node> = Api::all(client.clone());
    let all_nodes = nodes_api.list(&Default::default()).await?.items;
    let overlap = overlap::detect_overlap(&overlap_eligible(&all_pools), &all_nodes)?;

    let conflicting: Vec<String> = overlap
        .conflicts_for_pool(&name)
        .into_iter()
        .map(str::to_string)
        .collect();
    let had_overlap = context
        .registry
        .read()
        .unwrap()
        .get(&name)
        .map(|entry| entry.has_overlap)
        .unwrap_or(false);
    if !conflicting.is_empty() && !had_overlap {
        let detail: Vec<String> = conflicting
            .iter()
            .map(|node| format!("{} ({})", node, overlap.pools_for_node(node).join("/")))
            .collect();
        context
            .events
            .warning(
                &pool,
                events::POOL_OVERLAP,
                format!("nodes matched by multiple pools: {}", detail.join(", ")),
            )
            .await;
        eprintln!(
            "{}",
            format!(
                "⚠️ {} contested node(s) across pools [{}]",
                overlap.conflict_count(),
                overlap.all_conflicting_pools().join(", ")
            )
            .yellow()
        );
    } else if conflicting.is_empty() && had_overlap {
        context
            .events
            .normal(&pool, events::POOL_OVERLAP_RESOLVED, "pool overlap resolved".to_string())
            .await;
    }
    update_registry(&context, &name, |entry| {
        entry.has_overlap = !conflicting.is_empty();
    });
    #[cfg(feature = "metrics")]
    context
        .metrics
        .overlap_nodes_gauge
        .with_label_values(&[&name])
        .set(conflicting.len() as i64);
    let overlap_condition = if conflicting.is_empty() {
        status::make_condition(
            status::CONDITION_POOL_OVERLAP,
            false,
            "NoOverlap",
            String::new(),
        )
    } else {
        status::make_condition(
            status::CONDITION_POOL_OVERLAP,
            true,
            "OverlappingSelectors",
            format!("nodes matched by multiple pools: {}", conflicting.join(", ")),
        )
    };
    // An overlapped pool is degraded even when nothing else is wrong.
    let overlap_degraded = (!conflicting.is_empty())
        .then(|| format!("nodes matched by multiple pools: {}", conflicting.join(", ")));

    // Selection, then strip contested nodes before anything mutating.
    let selected_nodes = selector::select_nodes(&pool, &all_nodes)?;
    let configs_api: Api<HostConfig> = Api::all(client.clone());
    let all_configs = configs_api.list(&Default::default()).await?.items;
    let configs = selector::select_configs(&pool, &all_configs)?;
    let eligible_nodes = if overlap.has_conflicts() {
        overlap::filter_non_conflicting(selected_nodes.clone(), &overlap)
    } else {
        selected_nodes.clone()
    };

    // Nodes that drifted out of the pool keep no stale assignment behind.
    detach_departed_nodes(&client, &name, &all_nodes, &selected_nodes).await;

    let rendered = nodeforge_renderer::render(&configs);
    let policy_hash = util::pool_policy_hash(&pool.spec.reboot);
    let decision = context.debounce.check_and_update(
        &name,
        &rendered.config_hash,
        &policy_hash,
        Duration::from_secs(pool.spec.rollout.debounce_seconds),
        Utc::now(),
    );
    if !decision.proceed {
        // Not eligible yet, but keep the overlap surface fresh.
        let overlap_condition = overlap_condition.clone();
        let overlap_degraded = overlap_degraded.clone();
        patch_pool_status_with_retry(client.clone(), &name, move |s| {
            status::set_condition(&mut s.conditions, overlap_condition.clone());
            if let Some(message) = &overlap_degraded {
                status::push_degraded(
                    &mut s.conditions,
                    status::REASON_POOL_OVERLAP,
                    message.clone(),
                );
            }
        })
        .await?;
        return Ok(Action::requeue(
            decision.requeue_after.max(Duration::from_secs(1)),
        ));
    }

    // A pool with nothing to render must not cordon anything; it is trivially
    // converged.
    if configs.is_empty() {
        let count = eligible_nodes.len() as i32;
        let overlap_condition = overlap_condition.clone();
        let overlap_degraded = overlap_degraded.clone();
        patch_pool_status_with_retry(client.clone(), &name, move |s| {
            s.machine = count;
            s.ready = count;
            s.updated = count;
            s.target_revision = String::new();
            status::set_condition(&mut s.conditions, overlap_condition.clone());
            if let Some(message) = &overlap_degraded {
                status::push_degraded(
                    &mut s.conditions,
                    status::REASON_POOL_OVERLAP,
                    message.clone(),
                );
            }
        })
        .await?;
        return Ok(Action::requeue(PROBE_INTERVAL));
    }

    let artifact = match artifacts::ensure_artifact(client.clone(), &pool, &rendered).await {
        Ok(artifact) => artifact,
        Err(e) => {
            let message = e.to_string();
            eprintln!(
                "{}",
                format!("pool '{}' failed to materialize artifact: {}", name, message).red()
            );
            patch_pool_status_with_retry(client.clone(), &name, move |s| {
                status::push_degraded(
                    &mut s.conditions,
                    status::REASON_RENDER_FAILED,
                    message.clone(),
                );
            })
            .await?;
            // The next config or pool edit retries through its watch.
            return Ok(Action::await_change());
        }
    };
    let target_revision = artifact.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name])
        .observe(read_start.elapsed().as_secs_f64());
    #[cfg(feature = "metrics")]
    let write_start = std::time::Instant::now();

    // Batch = fresh starts within budget, plus everything already in flight.
    let new_starts = rollout::select_nodes_for_update(&pool, &eligible_nodes, &target_revision);
    let in_progress = rollout::collect_nodes_in_progress(&eligible_nodes, &target_revision);
    let mut batch = new_starts.clone();
    for node in in_progress {
        if !batch.iter().any(|n| n.name_any() == node.name_any()) {
            batch.push(node);
        }
    }
    // The union must come back out in rollout order so a retry walks the
    // same sequence.
    rollout::sort_nodes_for_update(&mut batch);
    if !new_starts.is_empty() {
        let mut names: Vec<String> = new_starts.iter().map(|n| n.name_any()).collect();
        let total = names.len();
        names.truncate(3);
        let suffix = if total > 3 {
            format!(" (+{} more)", total - 3)
        } else {
            String::new()
        };
        context
            .events
            .normal(
                &pool,
                events::ROLLOUT_BATCH,
                format!(
                    "starting rollout of {} to {} node(s): {}{}",
                    target_revision,
                    total,
                    names.join(", "),
                    suffix
                ),
            )
            .await;
    }

    // A broken drain-rules ConfigMap must never stall a rollout; warn and
    // fall back to defaults.
    let (drain_rules, rules_warning) =
        rules::load_drain_rules(client.clone(), &rules::drain_rules_namespace()).await?;
    if let Some(warning) = rules_warning {
        context
            .events
            .warning(&pool, events::DRAIN_CONFIG_INVALID, warning)
            .await;
    }

    let mut min_requeue: Option<Duration> = None;
    let mut track_requeue = |duration: Option<Duration>| {
        if let Some(duration) = duration {
            min_requeue = Some(min_requeue.map_or(duration, |m: Duration| m.min(duration)));
        }
    };
    // Derived from the persisted condition rather than process memory, so a
    // controller restart does not re-announce an already-stuck drain.
    let was_stuck = pool.status.as_ref().is_some_and(|s| {
        status::is_condition_true(&s.conditions, status::CONDITION_DRAIN_STUCK)
    });
    let mut drain_stuck_nodes: Vec<String> = Vec::new();
    for node in &batch {
        let node_name = node.name_any();
        let outcome = match update::process_node_update(
            client.clone(),
            &name,
            node,
            &target_revision,
            pool.spec.rollout.drain_timeout_seconds,
            pool.spec.rollout.drain_retry_seconds,
            Some(&drain_rules),
            &util::controller_namespace(),
            Utc::now(),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Per-node trouble never aborts the batch; the next pass
                // retries with a fresh view.
                eprintln!(
                    "{}",
                    format!("node '{}' update step failed: {}", node_name, e).red()
                );
                track_requeue(Some(Duration::from_secs(5)));
                continue;
            }
        };
        if outcome.cordoned {
            context
                .events
                .warning(&pool, events::NODE_CORDON, format!("cordoned node '{}'", node_name))
                .await;
        }
        if outcome.drain_started {
            context
                .events
                .warning(&pool, events::NODE_DRAIN, format!("draining node '{}'", node_name))
                .await;
        }
        if outcome.drain_failed {
            context
                .events
                .warning(&pool, events::DRAIN_FAILED, outcome.drain_failed_message.clone())
                .await;
        }
        if outcome.drain_stuck {
            drain_stuck_nodes.push(node_name.clone());
            // Event and counter fire on the transition into stuck, not on
            // every retry while it stays stuck.
            if !was_stuck {
                context
                    .events
                    .warning(&pool, events::DRAIN_STUCK, outcome.drain_stuck_message.clone())
                    .await;
                #[cfg(feature = "metrics")]
                context
                    .metrics
                    .drain_stuck_counter
                    .with_label_values(&[&name])
                    .inc();
            }
        }
        if outcome.drain_complete {
            context
                .events
                .normal(&pool, events::DRAIN_COMPLETE, format!("drained node '{}'", node_name))
                .await;
        }
        if outcome.uncordoned {
            context
                .events
                .normal(&pool, events::NODE_UNCORDON, format!("uncordoned node '{}'", node_name))
                .await;
            #[cfg(feature = "metrics")]
            if let Some(duration) = outcome.drain_duration {
                context
                    .metrics
                    .drain_duration_histogram
                    .with_label_values(&[&name])
                    .observe(duration.as_secs_f64());
            }
        }
        track_requeue(outcome.requeue_after);
    }
    drain_stuck_nodes.sort();
    update_registry(&context, &name, |entry| {
        entry.drain_stuck = !drain_stuck_nodes.is_empty();
    });

    // Node annotations moved under us; aggregate from a fresh listing.
    let all_nodes = nodes_api.list(&Default::default()).await?.items;
    let final_nodes =
        overlap::filter_non_conflicting(selector::select_nodes(&pool, &all_nodes)?, &overlap);
    let aggregated = status::aggregate(
        &final_nodes,
        &target_revision,
        status::apply_timeout(&pool),
        Utc::now(),
    );

    #[cfg(feature = "metrics")]
    {
        context
            .metrics
            .cordoned_nodes_gauge
            .with_label_values(&[&name])
            .set(aggregated.cordoned as i64);
        context
            .metrics
            .draining_nodes_gauge
            .with_label_values(&[&name])
            .set(aggregated.draining as i64);
    }

    let was_complete = pool.status.as_ref().is_some_and(|s| {
        s.machine > 0 && s.updated == s.machine && s.ready == s.machine && s.degraded == 0
    });
    {
        let aggregated = aggregated.clone();
        let target_revision = target_revision.clone();
        let overlap_condition = overlap_condition.clone();
        let overlap_degraded = overlap_degraded.clone();
        let drain_stuck_nodes = drain_stuck_nodes.clone();
        patch_pool_status_with_retry(client.clone(), &name, move |s| {
            status::apply_status_to_pool(s, &aggregated, &target_revision);
            status::set_condition(&mut s.conditions, overlap_condition.clone());
            if let Some(message) = &overlap_degraded {
                status::push_degraded(
                    &mut s.conditions,
                    status::REASON_POOL_OVERLAP,
                    message.clone(),
                );
            }
            if drain_stuck_nodes.is_empty() {
                status::set_condition(
                    &mut s.conditions,
                    status::make_condition(
                        status::CONDITION_DRAIN_STUCK,
                        false,
                        "NoDrainStuck",
                        String::new(),
                    ),
                );
            } else {
                let message = format!("drain stuck on: {}", drain_stuck_nodes.join(", "));
                status::set_condition(
                    &mut s.conditions,
                    status::make_condition(
                        status::CONDITION_DRAIN_STUCK,
                        true,
                        status::REASON_DRAIN_STUCK,
                        message.clone(),
                    ),
                );
                status::push_degraded(&mut s.conditions, status::REASON_DRAIN_STUCK, message);
            }
        })
        .await?;
    }
    if !was_complete && aggregated.is_complete() {
        context
            .events
            .normal(
                &pool,
                events::ROLLOUT_COMPLETE,
                format!("all {} node(s) at revision {}", aggregated.machine, target_revision),
            )
            .await;
    }
    for node_name in &aggregated.timed_out_nodes {
        context
            .events
            .warning(
                &pool,
                events::APPLY_TIMEOUT,
                format!("node '{}' has been applying beyond the timeout", node_name),
            )
            .await;
    }

    // Cleanup is best-effort housekeeping; log and carry on.
    if let Err(e) = artifacts::cleanup_old_artifacts(client.clone(), &pool, &final_nodes).await {
        eprintln!("{}", format!("artifact cleanup failed for '{}': {}", name, e).yellow());
    }
    if let Err(e) = artifacts::cleanup_orphaned(client.clone()).await {
        eprintln!("{}", format!("orphaned artifact cleanup failed: {}", e).yellow());
    }

    log_outcome(&context, &name, &batch, &drain_stuck_nodes, &aggregated).await;

    #[cfg(feature = "metrics")]
    {
        context
            .metrics
            .write_histogram
            .with_label_values(&[&name])
            .observe(write_start.elapsed().as_secs_f64());
        context
            .metrics
            .reconcile_counter
            .with_label_values(&[name.as_str(), if min_requeue.is_some() { "requeue" } else { "ok" }])
            .inc();
    }

    Ok(Action::requeue(min_requeue.unwrap_or(PROBE_INTERVAL)))
}

/// Pools whose selectors parse; a sibling pool with a broken selector fails
/// its own reconcile, it does not get to poison everyone's overlap pass.
fn overlap_eligible(pools: &[MachinePool]) -> Vec<MachinePool> {
    pools
        .iter()
        .filter(|pool| {
            pool.spec
                .node_selector
                .as_ref()
                .is_none_or(|selector| parse_selector(selector).is_ok())
        })
        .cloned()
        .collect()
}

/// Clears a departed node's assignment annotations once it stops matching
/// the pool. Best-effort; the next reconcile retries.
async fn detach_departed_nodes(
    client: &Client,
    pool_name: &str,
    all_nodes: &[Node],
    selected: &[Node],
) {
    use nodeforge_common::annotations;
    for node in all_nodes {
        let owned = annotations::get_str(node.annotations(), annotations::POOL) == Some(pool_name);
        let still_selected = selected
            .iter()
            .any(|candidate| candidate.name_any() == node.name_any());
        if owned && !still_selected {
            let node_name = node.name_any();
            if let Err(e) = cordon::remove_desired_revision(client.clone(), &node_name).await {
                eprintln!(
                    "{}",
                    format!("failed to detach node '{}': {}", node_name, e).yellow()
                );
            }
        }
    }
}

fn forget_pool(context: &ContextData, name: &str) {
    context.debounce.reset(name);
    context.registry.write().unwrap().remove(name);
    #[cfg(feature = "metrics")]
    context.metrics.reset_pool(name);
}

fn update_registry(context: &ContextData, name: &str, f: impl FnOnce(&mut PoolWatchEntry)) {
    let mut registry = context.registry.write().unwrap();
    f(registry.entry(name.to_string()).or_default());
}

/// Deduplicated progress logging: only state changes (or five quiet
/// minutes) make it to stdout.
async fn log_outcome(
    context: &ContextData,
    name: &str,
    batch: &[Node],
    drain_stuck: &[String],
    aggregated: &status::AggregatedStatus,
) {
    let summary = format!(
        "batch={} updated={}/{} stuck={}",
        batch.len(),
        aggregated.updated,
        aggregated.machine,
        drain_stuck.len(),
    );
    let previous = {
        let mut outcomes = context.last_outcome.lock().await;
        outcomes.insert(name.to_string(), (summary.clone(), Instant::now()))
    };
    if previous.is_none_or(|(last, at)| last != summary || at.elapsed() > Duration::from_secs(300))
    {
        println!(
            "🔧 {}{}{}",
            name.color(FG2),
            " • ".color(FG1),
            summary.color(FG2),
        );
    }
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Prints out the error to `stderr` and requeues the resource for another
/// reconciliation after five seconds.
fn on_error(instance: Arc<MachinePool>, error: &Error, context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error: {:?} on '{}'", error, instance.name_any()).red()
    );
    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&instance.name_any(), "error"])
        .inc();
    #[cfg(not(feature = "metrics"))]
    let _ = context;
    Action::requeue(Duration::from_secs(5))
}
