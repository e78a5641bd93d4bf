//! SSH session wrapper.
//!
//! One `SshSession` is opened per remote execution and closed right after it, so two
//! executions never share a control connection.

use std::error::Error as StdError;

use futures::future::join;
use openssh::{Session as SSHSession, SessionBuilder, Stdio};
use tokio::io::AsyncWriteExt;

use crate::dispatch::{CommandOutput, SshOptions};
use crate::error::MeshError;
use crate::resource::Credentials;

/// Lines ssh prints when the server turns the credentials down.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "permission denied",
    "authentication failed",
    "too many authentication failures",
];

pub struct SshSession {
    name: String,
    credentials: Credentials,
    session: SSHSession,
}

impl SshSession {
    pub async fn connect(
        name: &str,
        address: &str,
        port: Option<u16>,
        credentials: &Credentials,
        options: &SshOptions,
    ) -> Result<Self, MeshError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(credentials.username.clone())
            .known_hosts_check(options.host_keys.into())
            .connect_timeout(options.connect_timeout);
        if let Some(port) = port {
            builder.port(port);
        }
        if let Some(key) = credentials.auth.reveal() {
            builder.keyfile(key);
        }

        let session = match builder.connect_mux(address).await {
            Ok(session) => session,
            Err(e) => {
                let detail = credentials.redact(&error_chain(&e));
                tracing::warn!(resource = %name, %address, error = %detail, "failed to connect");
                return Err(classify_connect_failure(name, detail));
            }
        };
        tracing::info!(resource = %name, %address, "connected");
        Ok(Self {
            name: name.to_owned(),
            credentials: credentials.clone(),
            session,
        })
    }

    /// Streams `script` into `sh -s` on the remote host and collects everything it prints.
    pub async fn run(&self, script: &str) -> Result<CommandOutput, MeshError> {
        let mut command = self.session.command("sh");
        command
            .arg("-s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .await
            .map_err(|e| self.execution_error("failed to start remote shell", &e))?;

        let mut stdin = child.stdin().take();
        let feed = async move {
            if let Some(stdin) = stdin.as_mut() {
                stdin.write_all(script.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = join(feed, child.wait_with_output()).await;
        let output = match output {
            Ok(output) => output,
            Err(openssh::Error::Disconnected) => {
                return Err(MeshError::Connection {
                    target: self.name.clone(),
                    detail: "connection lost while the script was running".to_string(),
                })
            }
            Err(e) => return Err(self.execution_error("remote shell failed", &e)),
        };
        // A script that exits early never reads the rest of its input; that's not our failure.
        if let Err(e) = fed {
            tracing::debug!(resource = %self.name, error = %e, "remote shell closed stdin early");
        }
        Ok(output.into())
    }

    pub async fn close(self) {
        tracing::debug!(resource = %self.name, "terminating connection");
        if let Err(e) = self.session.close().await {
            let detail = self.credentials.redact(&error_chain(&e));
            tracing::warn!(resource = %self.name, error = %detail, "error while terminating");
        }
    }

    fn execution_error(&self, context: &str, error: &openssh::Error) -> MeshError {
        MeshError::ExecutionFailure {
            target: self.name.clone(),
            detail: format!("{}: {}", context, self.credentials.redact(&error_chain(error))),
        }
    }
}

/// Joins an error and all of its sources, since ssh's own message sits at the bottom.
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn classify_connect_failure(name: &str, detail: String) -> MeshError {
    let lowered = detail.to_lowercase();
    if AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        MeshError::Authentication {
            target: name.to_owned(),
            detail,
        }
    } else {
        MeshError::Connection {
            target: name.to_owned(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_permission_denied_is_authentication() {
        let err = classify_connect_failure(
            "web1",
            "failed to connect: ubuntu@web1: Permission denied (publickey).".to_string(),
        );
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_unreachable_is_connection() {
        let err = classify_connect_failure(
            "web1",
            "ssh: connect to host web1 port 22: No route to host".to_string(),
        );
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        #[derive(Debug, thiserror::Error)]
        #[error("failed to connect")]
        struct Wrapper(#[source] std::io::Error);
        let wrapped = Wrapper(std::io::Error::new(
            std::io::ErrorKind::Other,
            "Connection refused",
        ));
        assert_eq!(error_chain(&wrapped), "failed to connect: Connection refused");
    }
}
