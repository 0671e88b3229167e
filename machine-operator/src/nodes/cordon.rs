use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    client::Client,
};
use nodeforge_common::annotations;
use serde_json::{Value, json};

use super::{desired_revision, drain_started_at, is_cordoned_by_us, is_paused, is_unschedulable};
use crate::util::{Error, is_conflict, is_not_found};

/// Re-read, rebuild, re-patch until the write lands or becomes a no-op.
/// The builder returns None when the node already looks as desired. Returns
/// whether a patch was applied; a vanished node counts as a no-op.
async fn patch_node_with_retry(
    client: Client,
    name: &str,
    build: impl Fn(&Node) -> Option<Value>,
) -> Result<bool, Error> {
    let api: Api<Node> = Api::all(client);
    loop {
        let node = match api.get(name).await {
            Ok(node) => node,
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let Some(patch) = build(&node) else {
            return Ok(false);
        };
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(true),
            Err(e) if is_conflict(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Marks the node unschedulable and tags the cordon as ours. No-op if both
/// are already in place.
pub async fn cordon(client: Client, name: &str) -> Result<bool, Error> {
    patch_node_with_retry(client, name, |node| {
        if is_unschedulable(node) && is_cordoned_by_us(node) {
            return None;
        }
        Some(json!({
            "spec": { "unschedulable": true },
            "metadata": { "annotations": { annotations::CORDONED: "true" } },
        }))
    })
    .await
}

/// Restores schedulability and drops the cordon and drain bookkeeping.
pub async fn uncordon(client: Client, name: &str) -> Result<bool, Error> {
    patch_node_with_retry(client, name, |node| {
        let annotated = is_cordoned_by_us(node)
            || drain_started_at(node).is_some()
            || node
                .annotations()
                .contains_key(annotations::DRAIN_RETRY_COUNT);
        if !is_unschedulable(node) && !annotated {
            return None;
        }
        Some(json!({
            "spec": { "unschedulable": false },
            "metadata": { "annotations": {
                annotations::CORDONED: null,
                annotations::DRAIN_STARTED_AT: null,
                annotations::DRAIN_RETRY_COUNT: null,
            }},
        }))
    })
    .await
}

/// Stamps the start of a drain. Returns true only the first time.
pub async fn stamp_drain_started(
    client: Client,
    name: &str,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    patch_node_with_retry(client, name, |node| {
        if drain_started_at(node).is_some() {
            return None;
        }
        Some(json!({
            "metadata": { "annotations": {
                annotations::DRAIN_STARTED_AT: now.to_rfc3339(),
            }},
        }))
    })
    .await
}

pub async fn increment_drain_retry(client: Client, name: &str) -> Result<i64, Error> {
    let api: Api<Node> = Api::all(client.clone());
    loop {
        let node = match api.get(name).await {
            Ok(node) => node,
            Err(e) if is_not_found(&e) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let next = annotations::get_int(node.annotations(), annotations::DRAIN_RETRY_COUNT) + 1;
        let patch = json!({
            "metadata": { "annotations": {
                annotations::DRAIN_RETRY_COUNT: next.to_string(),
            }},
        });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(next),
            Err(e) if is_conflict(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub async fn clear_drain_annotations(client: Client, name: &str) -> Result<(), Error> {
    patch_node_with_retry(client, name, |node| {
        let present = drain_started_at(node).is_some()
            || node
                .annotations()
                .contains_key(annotations::DRAIN_RETRY_COUNT);
        if !present {
            return None;
        }
        Some(json!({
            "metadata": { "annotations": {
                annotations::DRAIN_STARTED_AT: null,
                annotations::DRAIN_RETRY_COUNT: null,
            }},
        }))
    })
    .await
    .map(|_| ())
}

/// Assigns the target revision, the owning pool, and the assignment stamp.
/// Paused nodes and nodes already assigned the target are left alone.
pub async fn set_desired_revision(
    client: Client,
    name: &str,
    revision: &str,
    pool: &str,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    patch_node_with_retry(client, name, |node| {
        if is_paused(node) || desired_revision(node) == Some(revision) {
            return None;
        }
        Some(json!({
            "metadata": { "annotations": {
                annotations::DESIRED_REVISION: revision,
                annotations::POOL: pool,
                annotations::DESIRED_REVISION_SET_AT: now.to_rfc3339(),
            }},
        }))
    })
    .await
}

pub async fn set_desired_revision_for_nodes(
    client: Client,
    nodes: &[Node],
    revision: &str,
    pool: &str,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    for node in nodes {
        set_desired_revision(client.clone(), &node.name_any(), revision, pool, now).await?;
    }
    Ok(())
}

/// Detaches a node that no longer belongs to the pool.
pub async fn remove_desired_revision(client: Client, name: &str) -> Result<(), Error> {
    patch_node_with_retry(client, name, |node| {
        let annotations_map = node.annotations();
        if !annotations_map.contains_key(annotations::DESIRED_REVISION)
            && !annotations_map.contains_key(annotations::POOL)
        {
            return None;
        }
        Some(json!({
            "metadata": { "annotations": {
                annotations::DESIRED_REVISION: null,
                annotations::POOL: null,
            }},
        }))
    })
    .await
    .map(|_| ())
}
