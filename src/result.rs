use std::fmt;

use crate::dispatch::CommandOutput;
use crate::error::{ErrorKind, MeshError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Succeeded,
    Failed,
    DispatchError,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Succeeded => f.write_str("succeeded"),
            Status::Failed => f.write_str("failed"),
            Status::DispatchError => f.write_str("dispatch error"),
        }
    }
}

/// Outcome of one execution. Built once by the engine and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    resource: String,
    status: Status,
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    error_kind: Option<ErrorKind>,
    error_detail: Option<String>,
}

impl ExecutionResult {
    /// The script ran. A non-zero or missing exit code makes it `Failed`.
    pub fn completed(resource: impl Into<String>, output: CommandOutput) -> Self {
        let (status, error_kind, error_detail) = match output.exit_code {
            Some(0) => (Status::Succeeded, None, None),
            Some(code) => (
                Status::Failed,
                Some(ErrorKind::ExecutionFailure),
                Some(format!("exited with status {}", code)),
            ),
            None => (
                Status::Failed,
                Some(ErrorKind::ExecutionFailure),
                Some("terminated by a signal".to_string()),
            ),
        };
        Self {
            resource: resource.into(),
            status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            error_kind,
            error_detail,
        }
    }

    /// The script never produced an exit status.
    pub fn dispatch_error(resource: impl Into<String>, kind: ErrorKind, detail: String) -> Self {
        Self {
            resource: resource.into(),
            status: Status::DispatchError,
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            error_kind: Some(kind),
            error_detail: Some(detail),
        }
    }

    pub fn from_error(resource: impl Into<String>, error: &MeshError) -> Self {
        Self::dispatch_error(resource, error.kind(), error.to_string())
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn succeeded(&self) -> bool {
        self.status == Status::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonzero_exit_is_failed() {
        let result = ExecutionResult::completed(
            "web1",
            CommandOutput {
                exit_code: Some(2),
                stdout: b"partial".to_vec(),
                stderr: b"boom".to_vec(),
            },
        );
        assert_eq!(result.status(), Status::Failed);
        assert_eq!(result.exit_code(), Some(2));
        assert_eq!(result.stdout(), b"partial");
        assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionFailure));
    }

    #[test]
    fn test_dispatch_error_has_no_exit_code() {
        let result = ExecutionResult::from_error("ghost", &MeshError::NotFound("ghost".into()));
        assert_eq!(result.status(), Status::DispatchError);
        assert_eq!(result.exit_code(), None);
        assert_eq!(result.error_kind(), Some(ErrorKind::NotFound));
        assert_eq!(result.error_detail(), Some("No resource matches 'ghost'"));
    }
}
