//! Child-process supervision: a small escalation ladder for reaping `git`
//! subprocesses that overrun their wait timeout, and the handful of
//! `tokio::process::Command` conventions every caller shares.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

/// Grace period given to a child after SIGTERM/SIGKILL before escalating
/// or giving up.
const ESCALATION_WAIT: Duration = Duration::from_secs(30);

/// Build a `git` invocation with the stdio shape every caller here needs:
/// stdin/stdout piped, stderr piped for error reporting, and no inherited
/// file descriptors beyond that.
pub fn git_command(cwd: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(cwd)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Deliberately no `kill_on_drop`: callers manage the child's lifetime
    // explicitly through `ensure_terminated`'s escalation ladder, including
    // the case where a client disconnects mid-request but the child must be
    // allowed to finish naturally (e.g. while holding a write lock).
    cmd
}

/// Wait for `child` to exit, escalating through SIGTERM and SIGKILL if it
/// overruns `wait_timeout`. Every step is logged. Returns the exit status
/// once the child actually exits, or `None` if it survived a SIGKILL plus
/// grace period (logged as an error; there is nothing further to do).
pub async fn ensure_terminated(
    child: &mut Child,
    wait_timeout: Duration,
    label: &str,
) -> Option<ExitStatus> {
    if let Ok(status) = tokio::time::timeout(wait_timeout, child.wait()).await {
        return status.ok();
    }

    tracing::warn!(label, timeout_secs = wait_timeout.as_secs(), "child process overran wait timeout, sending SIGTERM");
    send_signal(child, libc::SIGTERM);

    if let Ok(status) = tokio::time::timeout(ESCALATION_WAIT, child.wait()).await {
        return status.ok();
    }

    tracing::warn!(label, "child process ignored SIGTERM, sending SIGKILL");
    let _ = child.start_kill();

    if let Ok(status) = tokio::time::timeout(ESCALATION_WAIT, child.wait()).await {
        return status.ok();
    }

    tracing::error!(label, "child process survived SIGKILL after grace period");
    None
}

fn send_signal(child: &Child, signal: libc::c_int) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is a real process id reported by the OS for a child
        // we own; sending a signal to it is sound regardless of whether the
        // process has already exited (kill(2) just returns ESRCH).
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}

/// Render subprocess stderr for inclusion in logs/error responses. Binary
/// output (a corrupt pack written to stderr by accident, say) is replaced
/// with a placeholder rather than risking non-UTF-8 bytes downstream.
pub fn stderr_for_log(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim().to_string(),
        Err(_) => "<binary>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_for_log_passes_through_utf8() {
        assert_eq!(stderr_for_log(b"fatal: not a git repository\n"), "fatal: not a git repository");
    }

    #[test]
    fn stderr_for_log_replaces_non_utf8() {
        assert_eq!(stderr_for_log(&[0xff, 0xfe, 0x00]), "<binary>");
    }

    #[tokio::test]
    async fn ensure_terminated_returns_immediately_on_clean_exit() {
        let mut child = Command::new("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn `true`");
        let status = ensure_terminated(&mut child, Duration::from_secs(5), "test").await;
        assert!(status.expect("clean exit observed").success());
    }

    #[tokio::test]
    async fn ensure_terminated_sigterms_a_hanging_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn `sleep`");
        let status = ensure_terminated(&mut child, Duration::from_millis(50), "test").await;
        assert!(!status.expect("sigterm reaped the child").success());
    }
}
