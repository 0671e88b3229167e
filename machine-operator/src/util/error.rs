#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Yaml error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Failed to materialize rendered config: {0}")]
    Render(String),

    #[error("Eviction of pod '{pod}' blocked by its disruption budget")]
    DisruptionBlocked { pod: String },

    #[error("Drain incomplete on node '{node}': {evicted} evicted, {failed} failed")]
    DrainIncomplete {
        node: String,
        evicted: usize,
        failed: usize,
    },
}

/// 404s are routine during reconciliation (a pod finished on its own, a pool
/// was deleted mid-flight) and mostly mean "nothing left to do".
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// The eviction subresource answers 429 when a PodDisruptionBudget refuses
/// the eviction.
pub fn is_disruption_blocked(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 429)
}
