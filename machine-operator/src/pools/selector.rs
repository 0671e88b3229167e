use crate::util::Error;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::Selector;
use kube::core::SelectorExt;
use nodeforge_types::{HostConfig, MachinePool};
use std::collections::BTreeMap;

/// A nil selector matches everything; an unparseable one fails fast so the
/// pool surfaces a spec error instead of silently selecting nothing.
pub fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    let Some(selector) = selector else {
        return Ok(true);
    };
    let parsed = parse_selector(selector)?;
    Ok(parsed.matches(labels))
}

pub fn parse_selector(selector: &LabelSelector) -> Result<Selector, Error> {
    Selector::try_from(selector.clone())
        .map_err(|e| Error::UserInput(format!("invalid label selector: {e}")))
}

pub fn node_matches_pool(node: &Node, pool: &MachinePool) -> Result<bool, Error> {
    selector_matches(pool.spec.node_selector.as_ref(), node.labels())
}

pub fn config_matches_pool(config: &HostConfig, pool: &MachinePool) -> Result<bool, Error> {
    selector_matches(pool.spec.config_selector.as_ref(), config.labels())
}

pub fn select_nodes(pool: &MachinePool, nodes: &[Node]) -> Result<Vec<Node>, Error> {
    let mut selected = Vec::new();
    for node in nodes {
        if node_matches_pool(node, pool)? {
            selected.push(node.clone());
        }
    }
    Ok(selected)
}

pub fn select_configs(pool: &MachinePool, configs: &[HostConfig]) -> Result<Vec<HostConfig>, Error> {
    let mut selected = Vec::new();
    for config in configs {
        if config_matches_pool(config, pool)? {
            selected.push(config.clone());
        }
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use nodeforge_types::MachinePoolSpec;

    pub(crate) fn labeled_node(name: &str, labels: &[(&str, &str)]) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node
    }

    fn pool_selecting(labels: &[(&str, &str)]) -> MachinePool {
        MachinePool::new(
            "worker",
            MachinePoolSpec {
                node_selector: Some(LabelSelector {
                    match_labels: Some(
                        labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn nil_selector_matches_everything() {
        let pool = MachinePool::new("worker", MachinePoolSpec::default());
        let node = labeled_node("node-1", &[]);
        assert!(node_matches_pool(&node, &pool).unwrap());
    }

    #[test]
    fn match_labels_filter_nodes() {
        let pool = pool_selecting(&[("role", "worker")]);
        let hit = labeled_node("node-1", &[("role", "worker"), ("zone", "a")]);
        let miss = labeled_node("node-2", &[("role", "infra")]);
        let selected = select_nodes(&pool, &[hit, miss]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name.as_deref(), Some("node-1"));
    }

    #[test]
    fn match_expressions_are_honored() {
        let pool = MachinePool::new(
            "worker",
            MachinePoolSpec {
                node_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "role".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec!["worker".to_string(), "edge".to_string()]),
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert!(node_matches_pool(&labeled_node("n", &[("role", "edge")]), &pool).unwrap());
        assert!(!node_matches_pool(&labeled_node("n", &[("role", "infra")]), &pool).unwrap());
    }

    #[test]
    fn invalid_selector_fails_fast() {
        let pool = MachinePool::new(
            "worker",
            MachinePoolSpec {
                node_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "role".to_string(),
                        operator: "Sideways".to_string(),
                        values: None,
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let err = node_matches_pool(&labeled_node("n", &[]), &pool);
        assert!(matches!(err, Err(Error::UserInput(_))));
    }
}
