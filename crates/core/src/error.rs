//! Error taxonomy for the super-resolution core.
//!
//! Collaborators (network backends, config, CLI) work with `anyhow`; anything
//! that crosses the [`SrSession`](crate::session::SrSession) boundary is
//! classified into [`SrError`].

use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for session and device operations.
pub type Result<T, E = SrError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SrError {
    /// Network definition or weights could not be opened or parsed.
    #[error("failed to load {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    /// Channel count, scale factor or tile geometry the pipeline has no policy for.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Compute or memory failure surfaced by the device runtime.
    #[error("device error: {0}")]
    Device(#[source] BoxError),

    /// `process()` called on a session whose `load()` never succeeded.
    #[error("session has no loaded network")]
    NotLoaded,

    #[error("processing cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl SrError {
    pub fn load(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Self::Load {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn device(source: impl Into<BoxError>) -> Self {
        Self::Device(source.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(message.into())
    }

    /// Out-of-memory and other device failures are the only kinds a caller can
    /// reasonably retry with a smaller tile size.
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

impl From<anyhow::Error> for SrError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<SrError>() {
            Ok(inner) => inner,
            Err(other) => Self::Unknown(format!("{other:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_mentions_path() {
        let err = SrError::load(
            "models/x4.onnx",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        let text = err.to_string();
        assert!(text.contains("models/x4.onnx"));
        assert!(text.contains("no such file"));
    }

    #[test]
    fn anyhow_wrapping_an_sr_error_is_unwrapped() {
        let wrapped = anyhow::Error::new(SrError::NotLoaded);
        assert!(matches!(SrError::from(wrapped), SrError::NotLoaded));
    }

    #[test]
    fn foreign_anyhow_error_becomes_unknown_with_context_chain() {
        let err = anyhow::anyhow!("root cause").context("while staging tile");
        match SrError::from(err) {
            SrError::Unknown(message) => {
                assert!(message.contains("while staging tile"));
                assert!(message.contains("root cause"));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn only_device_errors_are_retryable() {
        assert!(SrError::device(anyhow::anyhow!("out of memory")).is_device());
        assert!(!SrError::unsupported("channels = 2").is_device());
    }
}
