//! The seam between the engine and whatever actually runs a script.

use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use openssh::KnownHosts;

use crate::error::MeshError;
use crate::local;
use crate::resource::{Resource, Target};
use crate::session::SshSession;

/// What a finished script left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Runs one script against one target.
///
/// A non-zero exit is a successful dispatch; only failing to run the script at all is an error.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        resource: &Resource,
        target: &Target,
        script: &str,
    ) -> Result<CommandOutput, MeshError>;
}

/// Host key verification policy for new SSH connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum HostKeyPolicy {
    /// Refuse hosts that are not already known.
    Strict,
    /// Accept and remember unknown hosts, refuse changed keys.
    #[default]
    Add,
    /// Accept anything.
    Accept,
}

impl From<HostKeyPolicy> for KnownHosts {
    fn from(policy: HostKeyPolicy) -> Self {
        match policy {
            HostKeyPolicy::Strict => KnownHosts::Strict,
            HostKeyPolicy::Add => KnownHosts::Add,
            HostKeyPolicy::Accept => KnownHosts::Accept,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    pub host_keys: HostKeyPolicy,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            host_keys: HostKeyPolicy::default(),
        }
    }
}

/// Local targets get a shell on this machine, remote targets an SSH session.
#[derive(Debug, Clone, Default)]
pub struct ShellDispatcher {
    ssh: SshOptions,
}

impl ShellDispatcher {
    pub fn new(ssh: SshOptions) -> Self {
        Self { ssh }
    }
}

#[async_trait]
impl Dispatch for ShellDispatcher {
    async fn dispatch(
        &self,
        resource: &Resource,
        target: &Target,
        script: &str,
    ) -> Result<CommandOutput, MeshError> {
        match target {
            Target::Local { credentials } => {
                local::run(&resource.name, credentials.as_ref(), script).await
            }
            Target::Remote {
                address,
                port,
                credentials,
            } => {
                let session =
                    SshSession::connect(&resource.name, address, *port, credentials, &self.ssh)
                        .await?;
                let result = session.run(script).await;
                // The session is closed no matter how the script went.
                session.close().await;
                result
            }
        }
    }
}
