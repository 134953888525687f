use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("duplicate {kind} id: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("invalid model: {0}")]
    Invalid(String),

    #[error("cannot parse model: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ModelError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        ModelError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
