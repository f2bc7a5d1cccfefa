use std::{
    fs::File,
    io,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, Stdio},
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::{setsid, Pid},
};
use tracing::warn;

/// How long `stop` waits for a guest to shut down before force-killing.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawn an emulator child with stdout+stderr captured to `log_path`.
///
/// The child gets its own session so it never shares our controlling
/// terminal, stdin is /dev/null, and the log file is created or truncated.
/// Returns the child plus the log handle; the handle stays with the
/// instance so the log lives exactly as long as the instance does.
pub fn start(argv: &[String], log_path: &Path) -> io::Result<(Child, File)> {
    let log = File::create(log_path)?;
    let stdout = log.try_clone()?;
    let stderr = log.try_clone()?;

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    unsafe {
        command.pre_exec(|| {
            setsid().map_err(io::Error::from)?;
            Ok(())
        });
    }

    // on failure the cloned log fds drop right here; the caller compensates
    let child = command.spawn()?;
    Ok((child, log))
}

/// Non-blocking liveness poll. Reaps the child as a side effect once it
/// has exited.
pub fn alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// SIGTERM, wait up to `grace`, then SIGKILL and reap. Always returns in
/// bounded time.
pub async fn stop(child: &mut Child, grace: Duration) {
    if !alive(child) {
        return;
    }

    let pid = Pid::from_raw(child.id() as i32);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        warn!("failed to signal pid {}: {}", pid, e);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while alive(child) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    if alive(child) {
        warn!("pid {} did not exit within {:?}, killing", pid, grace);
        if let Err(e) = child.kill() {
            warn!("failed to kill pid {}: {}", pid, e);
        }
        if let Err(e) = child.wait() {
            warn!("failed to reap pid {}: {}", pid, e);
        }
    }
}
