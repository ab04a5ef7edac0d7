use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowguardError {
    #[error("unknown policy key: {0}")]
    InvalidPolicyKey(String),

    #[error("invalid value {value} for policy '{key}': {reason}")]
    InvalidPolicyValue {
        key: String,
        value: f64,
        reason: String,
    },

    #[error("action not found: {0}")]
    ActionNotFound(uuid::Uuid),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("prediction model unavailable: {0}")]
    ModelUnavailable(String),

    /// Claim/complete bookkeeping detected an impossible state transition.
    /// The offending entry has already been forced to terminal `Failed`.
    #[error("queue invariant violated: {0}")]
    InvariantViolation(String),

    #[error("queue storage error: {0}")]
    QueueDb(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowguardError>;
