use thiserror::Error;

use otcoord_common::ModelError;

/// Failures of the outbound request/response channel to the simulator.
#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("simulator unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("command rejected by simulator: {0}")]
    Rejected(String),
}

impl ChannelError {
    /// Whether another attempt against the same simulator can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Unreachable(_) | ChannelError::Timeout(_) => true,
            ChannelError::Rejected(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Model(#[from] ModelError),

    /// An invariant that should be structurally impossible was violated.
    /// Logged prominently; the run continues where possible, a single bad
    /// decision costs less than aborting an expensive simulation.
    #[error("BUG: {0}")]
    Bug(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("decision module {module} failed: {message}")]
    Module { module: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl RuntimeError {
    /// Only transient failures are eligible for the bounded per-run retry;
    /// everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            RuntimeError::Channel(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_channel_failures_can_be_transient() {
        assert!(RuntimeError::Channel(ChannelError::Timeout(10)).is_transient());
        assert!(RuntimeError::Channel(ChannelError::Unreachable("down".to_string())).is_transient());
        assert!(!RuntimeError::Channel(ChannelError::Rejected("nope".to_string())).is_transient());
        let module = RuntimeError::Module {
            module: "max-speed".to_string(),
            message: "boom".to_string(),
        };
        assert!(!module.is_transient());
        assert_eq!(module.to_string(), "decision module max-speed failed: boom");
        assert!(!RuntimeError::Config("bad".to_string()).is_transient());
    }
}
