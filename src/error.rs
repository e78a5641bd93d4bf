use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("No resource matches '{0}'")]
    NotFound(String),
    #[error("Label '{label}' matches several resources: {}", .matches.join(", "))]
    AmbiguousTarget { label: String, matches: Vec<String> },
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("Failed to connect to '{target}': {detail}")]
    Connection { target: String, detail: String },
    #[error("Authentication rejected by '{target}': {detail}")]
    Authentication { target: String, detail: String },
    #[error("Script failed on '{target}': {detail}")]
    ExecutionFailure { target: String, detail: String },
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse resource file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl MeshError {
    /// Flat classification stored alongside execution results.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::NotFound(_) => ErrorKind::NotFound,
            MeshError::AmbiguousTarget { .. } => ErrorKind::AmbiguousTarget,
            MeshError::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            MeshError::Connection { .. } => ErrorKind::Connection,
            MeshError::Authentication { .. } => ErrorKind::Authentication,
            MeshError::ExecutionFailure { .. } => ErrorKind::ExecutionFailure,
            MeshError::Io(_) | MeshError::Parse(_) => ErrorKind::Io,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AmbiguousTarget,
    InvalidDescriptor,
    Connection,
    Authentication,
    ExecutionFailure,
    Io,
    /// The engine was cancelled before this execution finished.
    Cancelled,
    /// A worker died without reporting back.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AmbiguousTarget => "ambiguous target",
            ErrorKind::InvalidDescriptor => "invalid descriptor",
            ErrorKind::Connection => "connection error",
            ErrorKind::Authentication => "authentication error",
            ErrorKind::ExecutionFailure => "execution failure",
            ErrorKind::Io => "I/O error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_message_lists_every_match() {
        let err = MeshError::AmbiguousTarget {
            label: "prod".to_string(),
            matches: vec!["web1".to_string(), "web2".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Label 'prod' matches several resources: web1, web2"
        );
        assert_eq!(err.kind(), ErrorKind::AmbiguousTarget);
    }

    #[test]
    fn test_io_errors_classify_as_io() {
        let err: MeshError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
