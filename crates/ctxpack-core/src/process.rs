//! Blocking subprocess execution with a wall-clock deadline.
//!
//! Used for the optional external tools (version control, line search). A
//! missing binary or a timeout collapses to `None` plus a log line, so callers
//! can fall back without error plumbing.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// Stdin is closed; stdout and stderr are drained on helper threads so a
/// chatty child cannot block on a full pipe while we wait.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Option<CommandOutput> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(program = %program, error = %e, "Failed to spawn subprocess");
            return None;
        }
    };

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(
                    program = %program,
                    timeout_ms = timeout.as_millis() as u64,
                    "Subprocess timed out"
                );
                return None;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                warn!(program = %program, error = %e, "Failed to wait on subprocess");
                return None;
            }
        }
    };

    Some(CommandOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

/// Whether `binary` can be spawned and exits successfully for `--version`.
pub fn probe(binary: &str, timeout: Duration) -> bool {
    run_with_timeout(Command::new(binary).arg("--version"), timeout)
        .is_some_and(|out| out.status.success())
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_none() {
        let out = run_with_timeout(
            &mut Command::new("ctxpack-definitely-not-installed"),
            Duration::from_secs(1),
        );
        assert!(out.is_none());
        assert!(!probe("ctxpack-definitely-not-installed", Duration::from_secs(1)));
    }

    #[cfg(unix)]
    #[test]
    fn test_captures_stdout() {
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "echo hello; echo oops 1>&2"]),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_still_returns_output() {
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "exit 3"]),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.status.code(), Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let start = Instant::now();
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "sleep 5"]),
            Duration::from_millis(100),
        );
        assert!(out.is_none());
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
