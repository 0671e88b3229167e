use std::time::Duration;

pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "nodeforge-operator";

/// Namespace the controller runs in; pods here are never evicted.
pub(crate) fn controller_namespace() -> String {
    std::env::var("NAMESPACE").unwrap_or_else(|_| "nodeforge-system".to_string())
}

pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

/// 16-hex digest over the pool's reboot sub-spec, so a reboot-policy edit
/// walks the same debounce/rerender path as a config edit.
pub fn pool_policy_hash(reboot: &nodeforge_types::RebootPolicy) -> String {
    hash_spec(reboot).chars().take(16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_types::{RebootPolicy, RebootStrategy};

    #[test]
    fn policy_hash_is_sixteen_hex_chars() {
        let hash = pool_policy_hash(&RebootPolicy::default());
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn policy_hash_tracks_reboot_fields() {
        let quiet = RebootPolicy::default();
        let eager = RebootPolicy {
            strategy: RebootStrategy::Always,
            min_interval_seconds: 120,
        };
        assert_ne!(pool_policy_hash(&quiet), pool_policy_hash(&eager));
        assert_eq!(pool_policy_hash(&quiet), pool_policy_hash(&RebootPolicy::default()));
    }
}
