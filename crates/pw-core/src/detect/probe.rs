//! Empirical process-group kill probe.
//!
//! Spawns a throwaway child in its own group and tries to take the whole
//! group down. Any failure along the way reports `false`.

use crate::collect::tool_runner::CommandRunner;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// How long to wait for the probe child to be reaped after the group kill.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether a group kill works on this host.
#[cfg(unix)]
pub async fn probe_process_group_kill(_runner: &dyn CommandRunner, _timeout: Duration) -> bool {
    let mut child = match Command::new("sleep")
        .arg("5")
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!(error = %e, "process group probe could not spawn child");
            return false;
        }
    };

    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };

    // SAFETY: negative pid addresses the group we just created for the child.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            error = %std::io::Error::last_os_error(),
            "process group probe signal failed"
        );
        let _ = child.start_kill();
        let _ = child.wait().await;
        return false;
    }

    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            use std::os::unix::process::ExitStatusExt;
            let killed = status.signal() == Some(libc::SIGKILL);
            debug!(killed, "process group probe finished");
            killed
        }
        _ => false,
    }
}

/// Whether a tree kill through `taskkill /T /F` works on this host.
#[cfg(not(unix))]
pub async fn probe_process_group_kill(runner: &dyn CommandRunner, timeout: Duration) -> bool {
    let mut child = match Command::new("ping")
        .args(["-n", "6", "127.0.0.1"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!(error = %e, "process group probe could not spawn child");
            return false;
        }
    };

    let Some(pid) = child.id() else {
        return false;
    };
    let pid = pid.to_string();
    let ok = matches!(
        runner
            .run_tool("taskkill", &["/T", "/F", "/PID", &pid], Some(timeout))
            .await,
        Ok(output) if output.success()
    );
    if !ok {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return false;
    }

    matches!(
        tokio::time::timeout(REAP_TIMEOUT, child.wait()).await,
        Ok(Ok(_))
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::collect::ToolRunner;

    #[tokio::test]
    async fn test_probe_succeeds_on_unix() {
        let runner = ToolRunner::with_defaults();
        assert!(probe_process_group_kill(&runner, Duration::from_secs(2)).await);
    }
}
