// COLOCATE ERROR TYPES
// RECOVERABLE: BACKEND, METRICS. FATAL: CONFIGURATION, INVARIANT, IO.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend error on {job}: {reason}")]
    Backend { job: String, reason: String },

    #[error("metrics unavailable: {0}")]
    MetricsUnavailable(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("malformed event line: {0}")]
    MalformedEvent(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedError {
    pub fn backend(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            job: job.into(),
            reason: reason.into(),
        }
    }

    // THE LOOP KEEPS RUNNING ON THESE. EVERYTHING ELSE TERMINATES IT.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::MetricsUnavailable(_))
    }
}

pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(SchedError::backend("radix", "already paused").is_recoverable());
        assert!(SchedError::MetricsUnavailable("nan".into()).is_recoverable());
        assert!(!SchedError::Configuration("unknown job".into()).is_recoverable());
        assert!(!SchedError::InvariantViolation("empty cores".into()).is_recoverable());
    }

    #[test]
    fn backend_message_names_job() {
        let e = SchedError::backend("vips", "no such process");
        assert_eq!(e.to_string(), "backend error on vips: no such process");
    }
}
