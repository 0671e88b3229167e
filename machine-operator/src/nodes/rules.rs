use crate::util::{Error, is_not_found};
use glob_match::glob_match;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::{Api, ResourceExt, api::ListParams, client::Client};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Marker label identifying the drain-rules ConfigMap.
pub const DRAIN_RULES_LABEL: &str = "machine.nodeforge.io/drain-rules=true";
/// Payload key inside the ConfigMap holding the YAML document.
pub const DRAIN_RULES_KEY: &str = "rules.yaml";

/// Where the drain-rules ConfigMap lives; defaults to the controller's own
/// namespace.
pub fn drain_rules_namespace() -> String {
    std::env::var("DRAIN_RULES_CONFIGMAP_NAMESPACE")
        .unwrap_or_else(|_| crate::util::controller_namespace())
}

/// Operator-supplied exclusions from draining. Within a rule every populated
/// field must match (AND); across rules any match wins (OR).
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainRuleSet {
    pub defaults: DrainDefaults,
    pub rules: Vec<DrainRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainDefaults {
    /// Skip pods carrying a tolerate-everything toleration; they would just
    /// reschedule onto the cordoned node.
    pub skip_tolerates_all_pods: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainRule {
    pub namespaces: Vec<String>,
    pub namespace_prefixes: Vec<String>,
    /// Shell-glob patterns (`*`, `?`) over pod names.
    pub pod_names: Vec<String>,
    pub pod_labels: BTreeMap<String, String>,
}

impl DrainRule {
    /// True only if every populated field matches. An empty rule matches
    /// every pod.
    pub fn matches(&self, pod: &Pod) -> bool {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        if !self.namespaces.is_empty() && !self.namespaces.iter().any(|ns| *ns == namespace) {
            return false;
        }
        if !self.namespace_prefixes.is_empty()
            && !self
                .namespace_prefixes
                .iter()
                .any(|prefix| namespace.starts_with(prefix))
        {
            return false;
        }
        if !self.pod_names.is_empty()
            && !self.pod_names.iter().any(|pattern| glob_match(pattern, &name))
        {
            return false;
        }
        if !self.pod_labels.is_empty() {
            let labels = pod.labels();
            if !self
                .pod_labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
            {
                return false;
            }
        }
        true
    }
}

/// A toleration with an empty key and the Exists operator matches every
/// taint; such a pod would survive any cordon.
pub fn tolerates_everything(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.tolerations.as_ref())
        .is_some_and(|tolerations| {
            tolerations.iter().any(|t| {
                t.key.as_deref().unwrap_or("").is_empty()
                    && t.operator.as_deref() == Some("Exists")
            })
        })
}

impl DrainRuleSet {
    /// Returns whether the pod should be left in place, and why.
    pub fn should_skip_pod(&self, pod: &Pod) -> (bool, String) {
        if self.defaults.skip_tolerates_all_pods && tolerates_everything(pod) {
            return (true, "tolerate-all-pod".to_string());
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.matches(pod) {
                return (true, format!("rule-{index}"));
            }
        }
        (false, String::new())
    }
}

/// Loads the drain-rules ConfigMap from the controller namespace. Parse
/// problems are soft: the returned warning names the offending ConfigMap and
/// defaults apply, so a bad edit never halts rollouts.
pub async fn load_drain_rules(
    client: Client,
    namespace: &str,
) -> Result<(DrainRuleSet, Option<String>), Error> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(DRAIN_RULES_LABEL);
    let list = match api.list(&params).await {
        Ok(list) => list,
        Err(e) if is_not_found(&e) => return Ok((DrainRuleSet::default(), None)),
        Err(e) => return Err(e.into()),
    };
    let mut items = list.items;
    items.sort_by_key(|cm| cm.name_any());
    let Some(configmap) = items.into_iter().next() else {
        return Ok((DrainRuleSet::default(), None));
    };
    let name = configmap.name_any();
    let Some(payload) = configmap
        .data
        .as_ref()
        .and_then(|data| data.get(DRAIN_RULES_KEY))
    else {
        return Ok((
            DrainRuleSet::default(),
            Some(format!(
                "drain rules ConfigMap '{}/{}' has no '{}' key; using defaults",
                namespace, name, DRAIN_RULES_KEY
            )),
        ));
    };
    match serde_yaml::from_str::<DrainRuleSet>(payload) {
        Ok(rules) => Ok((rules, None)),
        Err(e) => Ok((
            DrainRuleSet::default(),
            Some(format!(
                "drain rules ConfigMap '{}/{}' is malformed ({}); using defaults",
                namespace, name, e
            )),
        )),
    }
}
