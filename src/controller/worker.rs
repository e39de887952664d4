//! Worker lifecycle — launch, non-blocking poll, terminate.
//!
//! A worker is one external validation process for one file. Stdout and
//! stderr are drained by background tasks into a shared buffer so the
//! controller loop never blocks on pipe backpressure; the loop only ever
//! calls `try_wait`.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::warn;

/// How long output collection waits for pipe EOF after the child exited.
/// A backgrounded grandchild can inherit the pipes and hold them open well
/// past the child's death; the controller must not wait for it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Non-blocking liveness status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    /// Process has exited. Signal-killed children report code -1.
    Exited(i32),
}

/// One in-flight external validation, exclusively owned by the controller.
pub struct WorkerHandle {
    pub file: String,
    child: Child,
    output: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
    pub started_at: Instant,
    term_requested_at: Option<Instant>,
    exit_code: Option<i32>,
}

impl WorkerHandle {
    /// Spawn `command` with the changed file appended as the last argument.
    ///
    /// `command` is split on whitespace: first token is the program, the rest
    /// are leading arguments. Spawn failures (missing executable, permission
    /// denied) surface as `Err` — the caller reports them and inserts nothing
    /// into the in-flight table.
    pub fn launch(command: &str, file: &str, cwd: &Path) -> io::Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty validation command")
        })?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg(file)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Last-resort cleanup if the controller is dropped without a
            // graceful shutdown (panic, fatal error).
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(drain(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(drain(stderr, output.clone()));
        }

        Ok(Self {
            file: file.to_string(),
            child,
            output,
            readers,
            started_at: Instant::now(),
            term_requested_at: None,
            exit_code: None,
        })
    }

    /// Non-blocking exit check. Once an exit is observed the code is cached,
    /// so repeated polls stay stable.
    pub fn poll(&mut self) -> WorkerStatus {
        if let Some(code) = self.exit_code {
            return WorkerStatus::Exited(code);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                self.exit_code = Some(code);
                WorkerStatus::Exited(code)
            }
            Ok(None) => WorkerStatus::Running,
            Err(err) => {
                warn!(file = %self.file, err = %err, "worker poll failed — treating as exited");
                self.exit_code = Some(-1);
                WorkerStatus::Exited(-1)
            }
        }
    }

    /// Request graceful termination. Idempotent; never waits for exit — the
    /// next reap pass observes the death, or escalates via
    /// [`force_kill`](Self::force_kill) once the grace period runs out.
    pub fn terminate(&mut self) {
        if self.exit_code.is_some() || self.term_requested_at.is_some() {
            return;
        }
        self.term_requested_at = Some(Instant::now());
        send_term(&mut self.child);
    }

    /// Escalate to an unconditional kill.
    pub fn force_kill(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Whether a termination request is older than `grace`.
    pub fn termination_overdue(&self, grace: Duration) -> bool {
        self.term_requested_at
            .map(|at| at.elapsed() >= grace)
            .unwrap_or(false)
    }

    /// Consume the handle and return the captured combined output.
    /// The pipe readers normally finish at EOF right after the process exits;
    /// the wait is bounded because an inherited pipe end (a grandchild the
    /// validation left behind) can keep a pipe open indefinitely. On timeout
    /// the readers are aborted and the buffer is snapshotted as-is.
    pub async fn into_output(mut self) -> String {
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
                warn!(file = %self.file, "output pipe still open after exit — abandoning reader");
                reader.abort();
            }
        }
        let bytes = match self.output.lock() {
            Ok(buf) => buf.clone(),
            Err(_) => Vec::new(),
        };
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }
}

/// Copy a child pipe into the shared output buffer until EOF.
fn drain<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

#[cfg(unix)]
fn send_term(child: &mut Child) {
    // SIGTERM lets the validation clean up; SIGKILL comes later if it stalls.
    if let Some(pid) = child.id() {
        let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn wait_exit(handle: &mut WorkerHandle) -> i32 {
        for _ in 0..100 {
            if let WorkerStatus::Exited(code) = handle.poll() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker did not exit in time");
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = WorkerHandle::launch("echo checking", "checked.txt", dir.path()).unwrap();
        let code = wait_exit(&mut handle).await;
        assert_eq!(code, 0);
        // The file path is appended as the last argument.
        let output = handle.into_output().await;
        assert_eq!(output, "checking checked.txt");
    }

    #[tokio::test]
    async fn reports_nonzero_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "#!/bin/sh\necho broken >&2\nexit 7\n").unwrap();

        let command = format!("/bin/sh {}", script.display());
        let mut handle = WorkerHandle::launch(&command, "some/file.rs", dir.path()).unwrap();
        let code = wait_exit(&mut handle).await;
        assert_eq!(code, 7);
        let output = handle.into_output().await;
        assert!(output.contains("broken"));
    }

    #[tokio::test]
    async fn launch_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = WorkerHandle::launch("/no/such/validator", "f", dir.path());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn launch_empty_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = WorkerHandle::launch("   ", "f", dir.path());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn terminate_stops_a_sleeping_worker() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();

        let command = format!("/bin/sh {}", script.display());
        let mut handle = WorkerHandle::launch(&command, "f", dir.path()).unwrap();
        assert_eq!(handle.poll(), WorkerStatus::Running);

        handle.terminate();
        let code = wait_exit(&mut handle).await;
        // Killed by SIGTERM — no exit code.
        assert_eq!(code, -1);
    }

    #[tokio::test]
    async fn background_grandchild_does_not_stall_output_collection() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("bg.sh");
        // The backgrounded sleep inherits the stdout/stderr pipes and keeps
        // them open long after the shell itself has exited.
        std::fs::write(&script, "#!/bin/sh\necho started\nsleep 10 &\nexit 0\n").unwrap();

        let command = format!("/bin/sh {}", script.display());
        let mut handle = WorkerHandle::launch(&command, "f", dir.path()).unwrap();
        let code = wait_exit(&mut handle).await;
        assert_eq!(code, 0);

        let begin = Instant::now();
        let output = handle.into_output().await;
        assert!(begin.elapsed() < Duration::from_secs(3));
        assert!(output.contains("started"));
    }

    #[tokio::test]
    async fn sigterm_ignored_then_force_killed() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stubborn.sh");
        std::fs::write(&script, "#!/bin/sh\ntrap '' TERM\nwhile :; do :; done\n").unwrap();

        let command = format!("/bin/sh {}", script.display());
        let mut handle = WorkerHandle::launch(&command, "f", dir.path()).unwrap();
        // Let the shell install its trap before the signal arrives.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.poll(), WorkerStatus::Running);

        handle.terminate();
        tokio::time::sleep(Duration::from_millis(300)).await;
        // SIGTERM was ignored; the worker is still alive and overdue.
        assert_eq!(handle.poll(), WorkerStatus::Running);
        assert!(handle.termination_overdue(Duration::from_millis(200)));

        handle.force_kill();
        let code = wait_exit(&mut handle).await;
        assert_eq!(code, -1);
    }

    #[tokio::test]
    async fn terminate_after_exit_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = WorkerHandle::launch("true", "f", dir.path()).unwrap();
        let code = wait_exit(&mut handle).await;
        assert_eq!(code, 0);

        // Already exited — must not error or change the observed status.
        handle.terminate();
        handle.terminate();
        assert_eq!(handle.poll(), WorkerStatus::Exited(0));
        assert!(!handle.termination_overdue(Duration::from_millis(0)));
    }
}
