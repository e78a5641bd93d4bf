//! Running scripts on the calling host.

use std::process::Stdio;

use futures::future::try_join;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::dispatch::CommandOutput;
use crate::error::MeshError;
use crate::resource::Credentials;

/// Runs `script` through `sh -s` in a fresh process.
///
/// When the credentials name a user other than the current one, the shell runs under that
/// user via non-interactive sudo. The shell leads its own process group; if the returned future
/// is dropped before the script exits, the whole group is killed, not just the shell.
pub async fn run(
    name: &str,
    credentials: Option<&Credentials>,
    script: &str,
) -> Result<CommandOutput, MeshError> {
    let mut command = match run_as(credentials) {
        Some(user) => {
            let mut command = Command::new("sudo");
            command.args(["-n", "-u", user, "sh", "-s"]);
            command
        }
        None => {
            let mut command = Command::new("sh");
            command.arg("-s");
            command
        }
    };
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| MeshError::ExecutionFailure {
        target: name.to_owned(),
        detail: format!("failed to start local shell: {}", e),
    })?;
    tracing::debug!(resource = %name, pid = ?child.id(), "spawned local shell");
    let mut group = GroupKill {
        pgid: child
            .id()
            .map(|pid| pid as libc::pid_t)
            .filter(|pid| *pid > 1),
    };

    let mut stdin = child.stdin.take().ok_or_else(|| MeshError::ExecutionFailure {
        target: name.to_owned(),
        detail: "local shell has no stdin".to_string(),
    })?;
    let feed = async move {
        let written = match stdin.write_all(script.as_bytes()).await {
            Ok(()) => stdin.shutdown().await,
            Err(e) => Err(e),
        };
        // A script may exit before reading all of its input.
        match written {
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    };
    let (_, output) = try_join(feed, child.wait_with_output())
        .await
        .map_err(|e| MeshError::ExecutionFailure {
            target: name.to_owned(),
            detail: format!("local shell I/O failed: {}", e),
        })?;
    // The shell exited on its own; whatever it left in the background is not ours to kill.
    group.disarm();
    Ok(output.into())
}

/// Sends SIGKILL to a process group when dropped, unless disarmed first.
struct GroupKill {
    pgid: Option<libc::pid_t>,
}

impl GroupKill {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        // A negative pid addresses the whole group.
        let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if ret == 0 {
            tracing::debug!(pgid, "killed local process group");
        } else {
            let error = std::io::Error::last_os_error();
            // ESRCH: the group is already gone.
            if error.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pgid, error = %error, "failed to kill local process group");
            }
        }
    }
}

fn run_as(credentials: Option<&Credentials>) -> Option<&str> {
    let user = credentials?.username.as_str();
    let current = std::env::var("USER").ok();
    if current.as_deref() == Some(user) {
        None
    } else {
        Some(user)
    }
}
