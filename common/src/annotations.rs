//! The annotation contract between the controller, the on-node agent, and
//! operators. Everything the controller knows about a node's rollout state is
//! carried in these keys; helpers below are the only sanctioned way to read
//! or write them.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

/// Controller-written: the revision the node should converge to.
pub const DESIRED_REVISION: &str = "machine.nodeforge.io/desired-revision";
/// Controller-written: the pool that assigned the desired revision.
pub const POOL: &str = "machine.nodeforge.io/pool";
/// Controller-written: marks a cordon as ours, as opposed to a manual one.
pub const CORDONED: &str = "machine.nodeforge.io/cordoned";
/// Controller-written: RFC3339 stamp of the first eviction attempt.
pub const DRAIN_STARTED_AT: &str = "machine.nodeforge.io/drain-started-at";
/// Controller-written: how many times the drain loop has come back around.
pub const DRAIN_RETRY_COUNT: &str = "machine.nodeforge.io/drain-retry-count";
/// Controller-written: RFC3339 stamp of the desired-revision assignment.
pub const DESIRED_REVISION_SET_AT: &str = "machine.nodeforge.io/desired-revision-set-at";

/// Agent-written: the revision currently applied on the host.
pub const CURRENT_REVISION: &str = "machine.nodeforge.io/current-revision";
/// Agent-written: idle | applying | rebooting | done | error.
pub const AGENT_STATE: &str = "machine.nodeforge.io/agent-state";
/// Agent-written: last apply error, if any.
pub const LAST_ERROR: &str = "machine.nodeforge.io/last-error";
/// Agent-written: the host needs a reboot to finish applying.
pub const REBOOT_PENDING: &str = "machine.nodeforge.io/reboot-pending";

/// Operator-written: exclude this node from rollouts entirely.
pub const PAUSED: &str = "machine.nodeforge.io/paused";
/// Operator-written: ask the agent for an unconditional reboot.
pub const FORCE_REBOOT: &str = "machine.nodeforge.io/force-reboot";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Applying,
    Rebooting,
    Done,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Applying => write!(f, "applying"),
            AgentState::Rebooting => write!(f, "rebooting"),
            AgentState::Done => write!(f, "done"),
            AgentState::Error => write!(f, "error"),
        }
    }
}

impl FromStr for AgentState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentState::Idle),
            "applying" => Ok(AgentState::Applying),
            "rebooting" => Ok(AgentState::Rebooting),
            "done" => Ok(AgentState::Done),
            "error" => Ok(AgentState::Error),
            _ => Err(()),
        }
    }
}

pub fn get_str<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    annotations.get(key).map(String::as_str)
}

/// Only the literal "true" counts; anything else (including absence) is false.
pub fn get_bool(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    annotations.get(key).is_some_and(|v| v == "true")
}

/// Missing or malformed values read as zero.
pub fn get_int(annotations: &BTreeMap<String, String>, key: &str) -> i64 {
    annotations
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Missing or malformed timestamps read as absent.
pub fn get_time(annotations: &BTreeMap<String, String>, key: &str) -> Option<DateTime<Utc>> {
    annotations
        .get(key)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Returns true if the map was modified.
pub fn set_if_different(
    annotations: &mut BTreeMap<String, String>,
    key: &str,
    value: &str,
) -> bool {
    if annotations.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    annotations.insert(key.to_string(), value.to_string());
    true
}

/// Returns true if the key existed.
pub fn delete_if_present(annotations: &mut BTreeMap<String, String>, key: &str) -> bool {
    annotations.remove(key).is_some()
}

pub fn agent_state(annotations: &BTreeMap<String, String>) -> Option<AgentState> {
    get_str(annotations, AGENT_STATE).and_then(|s| s.parse().ok())
}

pub fn is_node_paused(annotations: &BTreeMap<String, String>) -> bool {
    get_bool(annotations, PAUSED)
}

/// A node needs an update when it has been assigned a revision it has not
/// reached yet.
pub fn needs_update(annotations: &BTreeMap<String, String>) -> bool {
    match get_str(annotations, DESIRED_REVISION) {
        Some(desired) if !desired.is_empty() => {
            get_str(annotations, CURRENT_REVISION) != Some(desired)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn bool_requires_literal_true() {
        let m = map(&[(CORDONED, "true"), (PAUSED, "True"), (REBOOT_PENDING, "1")]);
        assert!(get_bool(&m, CORDONED));
        assert!(!get_bool(&m, PAUSED));
        assert!(!get_bool(&m, REBOOT_PENDING));
        assert!(!get_bool(&m, FORCE_REBOOT));
    }

    #[test]
    fn int_defaults_to_zero_on_garbage() {
        let m = map(&[(DRAIN_RETRY_COUNT, "7"), (LAST_ERROR, "boom")]);
        assert_eq!(get_int(&m, DRAIN_RETRY_COUNT), 7);
        assert_eq!(get_int(&m, LAST_ERROR), 0);
        assert_eq!(get_int(&m, DESIRED_REVISION), 0);
    }

    #[test]
    fn time_roundtrips_rfc3339() {
        let now = Utc::now();
        let m = map(&[
            (DRAIN_STARTED_AT, &now.to_rfc3339()),
            (DESIRED_REVISION_SET_AT, "yesterday-ish"),
        ]);
        let parsed = get_time(&m, DRAIN_STARTED_AT).expect("parse");
        assert_eq!(parsed.timestamp(), now.timestamp());
        assert!(get_time(&m, DESIRED_REVISION_SET_AT).is_none());
    }

    #[test]
    fn set_if_different_is_idempotent() {
        let mut m = map(&[]);
        assert!(set_if_different(&mut m, DESIRED_REVISION, "worker-ab12"));
        assert!(!set_if_different(&mut m, DESIRED_REVISION, "worker-ab12"));
        assert!(set_if_different(&mut m, DESIRED_REVISION, "worker-cd34"));
        assert!(delete_if_present(&mut m, DESIRED_REVISION));
        assert!(!delete_if_present(&mut m, DESIRED_REVISION));
    }

    #[test]
    fn needs_update_compares_revisions() {
        assert!(!needs_update(&map(&[])));
        assert!(needs_update(&map(&[(DESIRED_REVISION, "worker-ab12")])));
        assert!(needs_update(&map(&[
            (DESIRED_REVISION, "worker-ab12"),
            (CURRENT_REVISION, "worker-cd34"),
        ])));
        assert!(!needs_update(&map(&[
            (DESIRED_REVISION, "worker-ab12"),
            (CURRENT_REVISION, "worker-ab12"),
        ])));
    }

    #[test]
    fn agent_state_parses_known_values() {
        let m = map(&[(AGENT_STATE, "applying")]);
        assert_eq!(agent_state(&m), Some(AgentState::Applying));
        let m = map(&[(AGENT_STATE, "Applying")]);
        assert_eq!(agent_state(&m), None);
        assert_eq!(agent_state(&map(&[])), None);
    }
}
