use std::path::PathBuf;
use thiserror::Error;

/// A parse-time diagnostic with source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDiagnostic {
    pub path: PathBuf,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl std::fmt::Display for ParseDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.path.display(),
            self.line,
            self.column,
            self.message
        )
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(ParseDiagnostic),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("missing required context: {0}")]
    MissingContext(String),

    #[error("unresolved template variable {name:?} at step {step_index}")]
    UnresolvedTemplate { name: String, step_index: usize },

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("no available model satisfies requirements: {0}")]
    ModelUnsupported(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("session persistence is not supported by adapter {0}")]
    SessionPersistenceUnsupported(String),

    #[error("adapter {adapter} does not support {operation}")]
    NotSupported { adapter: String, operation: String },

    #[error("command failed with exit code {code}: {command}")]
    Run { command: String, code: i32 },

    #[error("command timed out after {seconds}s: {command}")]
    RunTimeout { command: String, seconds: u64 },

    #[error("verification {kind:?} failed with {errors} error(s)")]
    VerifyFailure { kind: String, errors: usize },

    #[error("adapter reported rate limit: {0}")]
    RateLimited(String),

    #[error("consultation expired: checkpoint is older than {timeout:?}")]
    ConsultExpired { timeout: std::time::Duration },

    #[error("loop detected: {0}")]
    LoopDetected(String),

    #[error("stop file requested shutdown: {0}")]
    StopFileRequested(PathBuf),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("paused: checkpoint written for session {0}")]
    Paused(String),

    #[error("consulting: checkpoint written for session {0}")]
    Consulting(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("plugin capability denied: {0}")]
    CapabilityDenied(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("render schema mismatch: document is {found}, reader supports {supported}")]
    SchemaMismatch { found: String, supported: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for this error.
    ///
    /// 0 success, 1 workflow error, 2 missing context (strict), 3 rate
    /// limited / consult expired, 4 cancelled, 5 paused (checkpoint written).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MissingContext(_) => 2,
            Error::RateLimited(_) | Error::ConsultExpired { .. } => 3,
            Error::Cancelled(_) => 4,
            Error::Paused(_) | Error::Consulting(_) => 5,
            _ => 1,
        }
    }

    /// Whether this error represents a durable suspension rather than a failure.
    pub fn is_suspension(&self) -> bool {
        matches!(self, Error::Paused(_) | Error::Consulting(_))
    }

    pub fn parse(
        path: impl Into<PathBuf>,
        line: usize,
        column: usize,
        message: impl Into<String>,
    ) -> Self {
        Error::Parse(ParseDiagnostic {
            path: path.into(),
            line,
            column,
            message: message.into(),
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::MissingContext("@src/*.rs".into()).exit_code(), 2);
        assert_eq!(Error::RateLimited("429".into()).exit_code(), 3);
        assert_eq!(
            Error::ConsultExpired {
                timeout: std::time::Duration::from_secs(60)
            }
            .exit_code(),
            3
        );
        assert_eq!(Error::Cancelled("interrupt".into()).exit_code(), 4);
        assert_eq!(Error::Paused("abc".into()).exit_code(), 5);
        assert_eq!(Error::Consulting("abc".into()).exit_code(), 5);
        assert_eq!(Error::Validation("bad".into()).exit_code(), 1);
    }

    #[test]
    fn test_parse_diagnostic_format() {
        let err = Error::parse("wf/build.flow", 12, 3, "unknown directive FROBNICATE");
        assert_eq!(
            err.to_string(),
            "parse error: wf/build.flow:12:3: unknown directive FROBNICATE"
        );
    }

    #[test]
    fn test_suspension_classification() {
        assert!(Error::Paused("s".into()).is_suspension());
        assert!(Error::Consulting("s".into()).is_suspension());
        assert!(!Error::Cancelled("s".into()).is_suspension());
    }
}
