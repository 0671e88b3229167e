use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Rollout pacing for a pool. All durations are in seconds; zero means
/// "use the built-in default" where one exists.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutPolicy {
    /// How many non-paused nodes may be unavailable at once. Integer or
    /// percentage string ("10%"). Unset means 1.
    pub max_unavailable: Option<IntOrString>,
    #[serde(default)]
    pub debounce_seconds: u64,
    #[serde(default)]
    pub drain_timeout_seconds: u64,
    #[serde(default)]
    pub drain_retry_seconds: u64,
    #[serde(default)]
    pub apply_timeout_seconds: u64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum RebootStrategy {
    #[default]
    Never,
    IfRequired,
    Always,
}

impl fmt::Display for RebootStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootStrategy::Never => write!(f, "Never"),
            RebootStrategy::IfRequired => write!(f, "IfRequired"),
            RebootStrategy::Always => write!(f, "Always"),
        }
    }
}

impl FromStr for RebootStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Never" => Ok(RebootStrategy::Never),
            "IfRequired" => Ok(RebootStrategy::IfRequired),
            "Always" => Ok(RebootStrategy::Always),
            _ => Err(()),
        }
    }
}

/// Reboot behavior the on-node agent should follow after applying a revision.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RebootPolicy {
    #[serde(default)]
    pub strategy: RebootStrategy,
    #[serde(default)]
    pub min_interval_seconds: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RevisionHistory {
    /// How many rendered revisions to retain per pool. Zero retains all.
    #[serde(default)]
    pub limit: u32,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "machine.nodeforge.io",
    version = "v1",
    kind = "MachinePool",
    plural = "machinepools",
    derive = "PartialEq",
    status = "MachinePoolStatus"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.target_revision\", \"name\": \"TARGET\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.updated\", \"name\": \"UPDATED\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.machine\", \"name\": \"MACHINES\", \"type\": \"integer\" }"
)]
#[kube(printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }")]
pub struct MachinePoolSpec {
    /// Which nodes belong to this pool. Unset matches every node.
    pub node_selector: Option<LabelSelector>,
    /// Which HostConfigs are merged into this pool's revision. Unset matches all.
    pub config_selector: Option<LabelSelector>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub rollout: RolloutPolicy,
    #[serde(default)]
    pub reboot: RebootPolicy,
    #[serde(default)]
    pub revision_history: RevisionHistory,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct MachinePoolStatus {
    #[serde(default)]
    pub target_revision: String,
    #[serde(default)]
    pub current_revision: String,
    #[serde(default)]
    pub last_successful_revision: String,
    #[serde(default)]
    pub machine: i32,
    #[serde(default)]
    pub ready: i32,
    #[serde(default)]
    pub updated: i32,
    #[serde(default)]
    pub updating: i32,
    #[serde(default)]
    pub degraded: i32,
    #[serde(default)]
    pub unavailable: i32,
    #[serde(default)]
    pub pending_reboot: i32,
    #[serde(default)]
    pub cordoned: i32,
    #[serde(default)]
    pub draining: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

/// A file the agent materializes on the host.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FileEntry {
    pub path: String,
    #[serde(default)]
    pub contents: String,
    pub mode: Option<i32>,
}

/// A systemd unit the agent manages on the host.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct UnitEntry {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    pub contents: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "machine.nodeforge.io",
    version = "v1",
    kind = "HostConfig",
    plural = "hostconfigs",
    derive = "PartialEq"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.priority\", \"name\": \"PRIORITY\", \"type\": \"integer\" }"
)]
pub struct HostConfigSpec {
    /// Merge order; lower priorities are applied first and may be overridden
    /// by higher ones. Content is otherwise opaque to the controller.
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub units: Vec<UnitEntry>,
}

fn default_priority() -> i32 {
    50
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "machine.nodeforge.io",
    version = "v1",
    kind = "RenderedHostConfig",
    plural = "renderedhostconfigs",
    derive = "PartialEq"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.pool_name\", \"name\": \"POOL\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.revision\", \"name\": \"REVISION\", \"type\": \"string\" }"
)]
pub struct RenderedHostConfigSpec {
    pub pool_name: String,
    /// Full hex digest of the merged configuration.
    pub config_hash: String,
    /// First ten hex characters of `config_hash`; the value nodes carry in
    /// their revision annotations.
    pub revision: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub units: Vec<UnitEntry>,
    /// Mirrored from the owning pool so the agent sees reboot policy without
    /// reading the pool. Updated in place on policy edits; content never is.
    #[serde(default)]
    pub reboot: RebootPolicy,
}
