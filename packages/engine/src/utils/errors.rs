// packages/engine/src/utils/errors.rs
//! Engine error types
//!
//! One error enum for the whole engine, grouped by where the failure
//! surfaces: configuration (rejected at init), construction (rejected on
//! first dispatch), runtime (a model step failed), scheduling (non-fatal
//! control mistakes) and I/O (output sinks).

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid inputs, out-of-range counts or an unusable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A referenced plugin id could not be resolved.
    #[error("unknown {kind} plugin '{id}'")]
    UnknownPlugin { kind: &'static str, id: String },

    /// A value failed to parse or validate against its attribute scope.
    #[error("invalid value for attribute '{attr}': {reason}")]
    InvalidValue { attr: String, reason: String },

    /// Node set or graph construction failed on first dispatch.
    #[error("construction error: {0}")]
    Construction(String),

    /// A model step reported failure at run time.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Play/pause/reset called in a state that cannot honour it.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// An output sink could not be written.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Scheduling errors are warnings, not failures; callers use this to
    /// decide whether to keep going.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::Scheduling(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = EngineError::UnknownPlugin {
            kind: "model",
            id: "nope".to_string(),
        };
        assert_eq!(err.to_string(), "unknown model plugin 'nope'");
    }

    #[test]
    fn test_fatality() {
        assert!(!EngineError::Scheduling("busy".into()).is_fatal());
        assert!(EngineError::Config("bad".into()).is_fatal());
    }
}
