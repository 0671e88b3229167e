use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Api, Resource, ResourceExt,
    api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    client::Client,
};
use nodeforge_renderer::Rendered;
use nodeforge_types::{MachinePool, RenderedHostConfig, RenderedHostConfigSpec};
use serde_json::json;
use std::collections::HashSet;

use crate::nodes;
use crate::util::{Error, is_not_found};

/// Label tying an artifact to its pool; cleanup lists by it.
pub const POOL_LABEL: &str = "machine.nodeforge.io/pool";

/// How many suffixed names to probe when the base name is taken by a
/// different hash. Exhausting these is a contract violation.
const MAX_NAME_ATTEMPTS: usize = 10;

/// `<pool>-<rev>`, then `<pool>-<rev>-1` .. `<pool>-<rev>-10`.
fn candidate_names(base: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(base.to_string())
        .chain((1..=MAX_NAME_ATTEMPTS).map(move |suffix| format!("{base}-{suffix}")))
}

async fn get_artifact(
    api: &Api<RenderedHostConfig>,
    name: &str,
) -> Result<Option<RenderedHostConfig>, Error> {
    match api.get(name).await {
        Ok(artifact) => Ok(Some(artifact)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn build_artifact(
    name: &str,
    pool: &MachinePool,
    rendered: &Rendered,
    owner: OwnerReference,
) -> RenderedHostConfig {
    RenderedHostConfig {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [(POOL_LABEL.to_string(), pool.name_any())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: RenderedHostConfigSpec {
            pool_name: pool.name_any(),
            config_hash: rendered.config_hash.clone(),
            revision: rendered.revision.clone(),
            files: rendered.files.clone(),
            units: rendered.units.clone(),
            reboot: pool.spec.reboot.clone(),
        },
    }
}

/// Makes sure exactly one artifact exists for {pool, hash} and returns it.
/// The content of an existing artifact is never touched; only a changed
/// reboot policy is patched through, so policy edits propagate without a new
/// revision. Short-hash collisions resolve to suffixed names.
pub async fn ensure_artifact(
    client: Client,
    pool: &MachinePool,
    rendered: &Rendered,
) -> Result<RenderedHostConfig, Error> {
    let api: Api<RenderedHostConfig> = Api::all(client);
    let base = format!("{}-{}", pool.name_any(), rendered.revision);
    let owner = pool.controller_owner_ref(&()).ok_or_else(|| {
        Error::UserInput("MachinePool is missing metadata needed for ownership".to_string())
    })?;

    for name in candidate_names(&base) {
        match get_artifact(&api, &name).await? {
            Some(existing) if existing.spec.config_hash == rendered.config_hash => {
                if existing.spec.reboot != pool.spec.reboot {
                    let patch = json!({ "spec": { "reboot": pool.spec.reboot } });
                    let patched = api
                        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    return Ok(patched);
                }
                return Ok(existing);
            }
            // Name taken by a different hash: probe the next suffix.
            Some(_) => continue,
            None => {
                let artifact = build_artifact(&name, pool, rendered, owner.clone());
                match api.create(&PostParams::default(), &artifact).await {
                    Ok(created) => return Ok(created),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        // Lost a race; whoever won may or may not hold our hash.
                        match get_artifact(&api, &name).await? {
                            Some(existing)
                                if existing.spec.config_hash == rendered.config_hash =>
                            {
                                return Ok(existing);
                            }
                            _ => continue,
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Err(Error::Render(format!(
        "exhausted {} name candidates for '{}'",
        MAX_NAME_ATTEMPTS + 1,
        base
    )))
}

/// Revisions that must survive cleanup: the pool's target plus anything a
/// node still points at, desired or current.
fn in_use_revisions(pool: &MachinePool, nodes: &[k8s_openapi::api::core::v1::Node]) -> HashSet<String> {
    let mut in_use = HashSet::new();
    if let Some(status) = &pool.status
        && !status.target_revision.is_empty()
    {
        in_use.insert(status.target_revision.clone());
    }
    for node in nodes {
        if let Some(rev) = nodes::desired_revision(node) {
            in_use.insert(rev.to_string());
        }
        if let Some(rev) = nodes::current_revision(node) {
            in_use.insert(rev.to_string());
        }
    }
    in_use
}

/// Oldest-first victims, skipping in-use names, until `limit` remain.
fn select_artifacts_to_delete(
    artifacts: &[RenderedHostConfig],
    limit: usize,
    in_use: &HashSet<String>,
) -> Vec<String> {
    let mut remaining = artifacts.len();
    let mut victims = Vec::new();
    for artifact in artifacts {
        if remaining <= limit {
            break;
        }
        let name = artifact.name_any();
        if in_use.contains(&name) {
            continue;
        }
        victims.push(name);
        remaining -= 1;
    }
    victims
}

/// Prunes revisions beyond the pool's history limit. A limit of zero keeps
/// everything.
pub async fn cleanup_old_artifacts(
    client: Client,
    pool: &MachinePool,
    nodes: &[k8s_openapi::api::core::v1::Node],
) -> Result<(), Error> {
    let limit = pool.spec.revision_history.limit as usize;
    if limit == 0 {
        return Ok(());
    }
    let api: Api<RenderedHostConfig> = Api::all(client);
    let params = ListParams::default().labels(&format!("{}={}", POOL_LABEL, pool.name_any()));
    let mut artifacts = api.list(&params).await?.items;
    artifacts.sort_by_key(|a| {
        (
            a.metadata.creation_timestamp.clone().map(|t| t.0),
            a.name_any(),
        )
    });
    let in_use = in_use_revisions(pool, nodes);
    for name in select_artifacts_to_delete(&artifacts, limit, &in_use) {
        match api.delete(&name, &Default::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Sweeps artifacts whose pool no longer exists (e.g. orphaned by a
/// non-cascading delete).
pub async fn cleanup_orphaned(client: Client) -> Result<usize, Error> {
    let pools: Api<MachinePool> = Api::all(client.clone());
    let pool_names: HashSet<String> = pools
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .map(|p| p.name_any())
        .collect();
    let api: Api<RenderedHostConfig> = Api::all(client);
    let mut deleted = 0;
    for artifact in api.list(&ListParams::default()).await?.items {
        if pool_names.contains(&artifact.spec.pool_name) {
            continue;
        }
        match api.delete(&artifact.name_any(), &Default::default()).await {
            Ok(_) => deleted += 1,
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}
