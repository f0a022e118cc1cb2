//! Capsule process supervision.
//!
//! Builds the launch command from a manifest, spawns the child with all three
//! stdio pipes attached, starts the stdout demultiplexer and the stderr
//! forwarder, and tears everything down again on shutdown.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::demux::{Demultiplexer, PendingCalls};
use super::errors::CapsuleError;
use super::logger::CapsuleLogger;
use super::types::HelloNotification;
use crate::manifest::ToolManifest;

// ─── Command ─────────────────────────────────────────────────────────────────

/// Build the launch command for a capsule.
///
/// `interpreter path args...` when an interpreter is set, `path args...`
/// otherwise. Manifest env is layered over the inherited environment and the
/// working directory is the entrypoint's directory.
pub fn build_command(manifest: &ToolManifest) -> Command {
    let entrypoint = absolute_entrypoint(manifest);

    let mut cmd = match manifest.interpreter.as_deref().filter(|i| !i.is_empty()) {
        Some(interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(&entrypoint);
            cmd
        }
        None => Command::new(&entrypoint),
    };

    cmd.args(manifest.runtime_args());
    cmd.envs(manifest.runtime_env());

    if let Some(dir) = entrypoint.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd
}

/// A relative entrypoint would resolve differently once the working
/// directory changes, so anchor it to the host's current directory.
fn absolute_entrypoint(manifest: &ToolManifest) -> PathBuf {
    if manifest.path.is_absolute() {
        return manifest.path.clone();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(&manifest.path),
        Err(_) => manifest.path.clone(),
    }
}

/// A freshly spawned child with its pipes detached.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn the capsule process. No child is left running on failure.
pub fn spawn(manifest: &ToolManifest) -> Result<SpawnedProcess, CapsuleError> {
    let mut child = build_command(manifest)
        .spawn()
        .map_err(|e| CapsuleError::SpawnFailed {
            tool: manifest.name.clone(),
            reason: e.to_string(),
        })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let missing = match (&stdin, &stdout, &stderr) {
        (None, _, _) => Some("stdin"),
        (_, None, _) => Some("stdout"),
        (_, _, None) => Some("stderr"),
        _ => None,
    };

    match (stdin, stdout, stderr) {
        (Some(stdin), Some(stdout), Some(stderr)) => Ok(SpawnedProcess {
            child,
            stdin,
            stdout,
            stderr,
        }),
        _ => {
            let _ = child.start_kill();
            Err(CapsuleError::PipeUnavailable {
                tool: manifest.name.clone(),
                pipe: missing.unwrap_or("stdio"),
            })
        }
    }
}

// ─── Stdin Writer ────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared, closable handle to a capsule's stdin.
///
/// Each frame is written and flushed under the lock, so concurrent callers
/// never interleave bytes.
#[derive(Clone)]
pub struct StdinWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
}

impl fmt::Debug for StdinWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdinWriter").finish_non_exhaustive()
    }
}

impl StdinWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    /// Wait for exclusive use of the pipe.
    ///
    /// Dropping this future before it resolves leaves the pipe untouched.
    pub async fn lock(&self) -> StdinGuard {
        StdinGuard(Arc::clone(&self.inner).lock_owned().await)
    }

    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.lock().await.write_frame(frame).await
    }

    /// Close the pipe. Later writes fail with `BrokenPipe`.
    pub async fn close(&self) -> io::Result<()> {
        let taken = self.inner.lock().await.take();
        match taken {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }
}

/// Exclusive access to a capsule's stdin, held for one frame.
pub struct StdinGuard(OwnedMutexGuard<Option<BoxedWriter>>);

impl StdinGuard {
    pub async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let Some(writer) = self.0.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "capsule stdin is closed",
            ));
        };
        writer.write_all(frame).await?;
        writer.flush().await
    }
}

// ─── Capsule Process ─────────────────────────────────────────────────────────

/// What a tool call needs from the live process.
#[derive(Debug, Clone)]
pub struct CallChannel {
    pub stdin: StdinWriter,
    pub lifetime: CancellationToken,
}

/// A running capsule child plus the tasks attached to its pipes.
#[derive(Debug)]
pub struct CapsuleProcess {
    child: Child,
    stdin: StdinWriter,
    lifetime: CancellationToken,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl CapsuleProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn channel(&self) -> CallChannel {
        CallChannel {
            stdin: self.stdin.clone(),
            lifetime: self.lifetime.clone(),
        }
    }

    /// Cancel the process lifetime. In-flight calls and the reader unblock.
    pub fn cancel(&self) {
        self.lifetime.cancel();
    }

    /// Close the pipes, force-kill the child if it is still running, and
    /// reap it.
    ///
    /// Pipe and task failures are logged. Kill and wait failures are
    /// collected into a single [`CapsuleError::ShutdownFailed`].
    pub async fn shutdown(mut self, tool: &str, logger: &dyn CapsuleLogger) -> Result<(), CapsuleError> {
        self.lifetime.cancel();

        if let Err(e) = self.stdin.close().await {
            logger.error("Failed to close stdin pipe", &[("tool", &tool), ("error", &e)]);
        }
        // The reader owns stdout and drops it on exit.
        if let Err(e) = self.reader.await {
            logger.error("Failed to close stdout pipe", &[("tool", &tool), ("error", &e)]);
        }
        if let Err(e) = self.stderr.await {
            logger.error("Failed to close stderr pipe", &[("tool", &tool), ("error", &e)]);
        }

        let mut failures = Vec::new();

        match self.child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                if let Err(e) = self.child.start_kill() {
                    failures.push(format!("failed to kill capsule process: {e}"));
                }
            }
        }

        match self.child.wait().await {
            Ok(status) => logger.debug(
                "Capsule process exited",
                &[("tool", &tool), ("status", &status)],
            ),
            Err(e) => failures.push(format!("failed to wait for capsule process: {e}")),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CapsuleError::ShutdownFailed {
                tool: tool.to_string(),
                failures,
            })
        }
    }
}

/// Spawn the capsule and attach its background tasks.
///
/// Returns the process and the receiving end of the handshake channel.
/// Everything attached to the process stops when `lifetime` is cancelled.
pub fn launch(
    manifest: &ToolManifest,
    lifetime: CancellationToken,
    pending: Arc<PendingCalls>,
    logger: Arc<dyn CapsuleLogger>,
) -> Result<(CapsuleProcess, mpsc::Receiver<HelloNotification>), CapsuleError> {
    let SpawnedProcess {
        child,
        stdin,
        stdout,
        stderr,
    } = spawn(manifest)?;

    logger.debug(
        "Capsule process spawned",
        &[
            ("tool", &manifest.name),
            ("pid", &child.id().unwrap_or_default()),
        ],
    );

    let (hello_tx, hello_rx) = mpsc::channel(1);
    let reader = Demultiplexer::new(
        &manifest.name,
        pending,
        hello_tx,
        lifetime.clone(),
        Arc::clone(&logger),
    )
    .spawn(stdout);
    let stderr = forward_stderr(&manifest.name, stderr, lifetime.clone(), logger);

    Ok((
        CapsuleProcess {
            child,
            stdin: StdinWriter::new(stdin),
            lifetime,
            reader,
            stderr,
        },
        hello_rx,
    ))
}

/// Log each stderr line of the child at debug level.
fn forward_stderr(
    tool: &str,
    stderr: ChildStderr,
    lifetime: CancellationToken,
    logger: Arc<dyn CapsuleLogger>,
) -> JoinHandle<()> {
    let tool = tool.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = lifetime.cancelled() => return,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => logger.debug("Capsule stderr", &[("tool", &tool), ("line", &line)]),
                Ok(None) | Err(_) => return,
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
