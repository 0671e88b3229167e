//! Merges a pool's HostConfigs into a single rendered document and derives
//! its content hash. Rendering is deterministic: the same set of configs
//! always produces the same hash, regardless of list order.

use nodeforge_types::{FileEntry, HostConfig, UnitEntry};
use serde::Serialize;
use std::collections::BTreeMap;

/// Ten hex characters, the revision form carried in node annotations and
/// artifact names.
pub const SHORT_REVISION_LEN: usize = 10;

#[derive(Clone, Debug, PartialEq)]
pub struct Rendered {
    pub files: Vec<FileEntry>,
    pub units: Vec<UnitEntry>,
    /// Full SHA-256 hex digest over the merged content.
    pub config_hash: String,
    /// First [`SHORT_REVISION_LEN`] chars of `config_hash`.
    pub revision: String,
}

#[derive(Serialize)]
struct Merged<'a> {
    files: &'a [FileEntry],
    units: &'a [UnitEntry],
}

pub fn hash_value<T: Serialize>(value: &T) -> String {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(value).expect("serialize for hashing");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

pub fn short_revision(config_hash: &str) -> String {
    config_hash.chars().take(SHORT_REVISION_LEN).collect()
}

/// Merge configs in (priority, name) order. Within the merged document a
/// later config wins per file path and per unit name.
pub fn render(configs: &[HostConfig]) -> Rendered {
    let mut ordered: Vec<&HostConfig> = configs.iter().collect();
    ordered.sort_by(|a, b| {
        (a.spec.priority, a.metadata.name.as_deref().unwrap_or(""))
            .cmp(&(b.spec.priority, b.metadata.name.as_deref().unwrap_or("")))
    });

    let mut files: BTreeMap<String, FileEntry> = BTreeMap::new();
    let mut units: BTreeMap<String, UnitEntry> = BTreeMap::new();
    for config in ordered {
        for file in &config.spec.files {
            files.insert(file.path.clone(), file.clone());
        }
        for unit in &config.spec.units {
            units.insert(unit.name.clone(), unit.clone());
        }
    }

    let files: Vec<FileEntry> = files.into_values().collect();
    let units: Vec<UnitEntry> = units.into_values().collect();
    let config_hash = hash_value(&Merged {
        files: &files,
        units: &units,
    });
    let revision = short_revision(&config_hash);
    Rendered {
        files,
        units,
        config_hash,
        revision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_types::HostConfigSpec;

    fn config(name: &str, priority: i32, files: &[(&str, &str)]) -> HostConfig {
        HostConfig::new(
            name,
            HostConfigSpec {
                priority,
                files: files
                    .iter()
                    .map(|(path, contents)| FileEntry {
                        path: path.to_string(),
                        contents: contents.to_string(),
                        mode: None,
                    })
                    .collect(),
                units: vec![],
            },
        )
    }

    #[test]
    fn render_is_order_independent() {
        let a = config("base", 10, &[("/etc/a", "1")]);
        let b = config("site", 50, &[("/etc/b", "2")]);
        let forward = render(&[a.clone(), b.clone()]);
        let backward = render(&[b, a]);
        assert_eq!(forward.config_hash, backward.config_hash);
        assert_eq!(forward.revision.len(), SHORT_REVISION_LEN);
    }

    #[test]
    fn higher_priority_wins_per_path() {
        let low = config("base", 10, &[("/etc/motd", "hello")]);
        let high = config("site", 90, &[("/etc/motd", "goodbye")]);
        let rendered = render(&[low, high]);
        assert_eq!(rendered.files.len(), 1);
        assert_eq!(rendered.files[0].contents, "goodbye");
    }

    #[test]
    fn priority_ties_break_by_name() {
        let a = config("aaa", 50, &[("/etc/motd", "from-a")]);
        let z = config("zzz", 50, &[("/etc/motd", "from-z")]);
        let rendered = render(&[z.clone(), a.clone()]);
        assert_eq!(rendered.files[0].contents, "from-z");
        // Same set, same hash, whatever the input order.
        assert_eq!(rendered.config_hash, render(&[a, z]).config_hash);
    }

    #[test]
    fn content_change_changes_revision() {
        let before = render(&[config("base", 10, &[("/etc/a", "1")])]);
        let after = render(&[config("base", 10, &[("/etc/a", "2")])]);
        assert_ne!(before.config_hash, after.config_hash);
        assert_ne!(before.revision, after.revision);
    }
}
