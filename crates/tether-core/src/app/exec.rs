//! Subprocess execution under a cancellable context.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{ProcessOutcome, WrapperError};

/// How long to keep reading pipes after a cancelled child was killed.
/// Grandchildren can hold the pipes open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What happens to the child's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutMode {
    /// Buffer it (envelope mode uploads it as a blob).
    Capture,
    /// Hand the wrapper's own stdout to the child.
    Inherit,
}

/// Result of running a command. Stderr is always buffered.
#[derive(Debug, Clone)]
pub struct Captured {
    pub outcome: ProcessOutcome,
    pub stdout: Bytes,
    pub stderr: Bytes,
    /// The run was cancelled and the child killed; the buffers hold what
    /// it wrote before that.
    pub cancelled: bool,
}

impl Captured {
    fn never_started(error: String) -> Self {
        Self {
            outcome: ProcessOutcome::never_started(error),
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            cancelled: false,
        }
    }
}

type PipeBuffer = Arc<Mutex<Vec<u8>>>;

/// Run `program args...` to completion.
///
/// A launch failure is not an `Err`: it becomes `ProcessOutcome::NeverStarted`
/// so it can be classified and recorded. Cancellation kills the child and
/// returns whatever it had written, with `cancelled` set.
pub async fn run_command(
    program: &str,
    args: &[String],
    stdout: StdoutMode,
    cancel: &CancellationToken,
) -> Result<Captured, WrapperError> {
    let stdout_cfg = match stdout {
        StdoutMode::Capture => Stdio::piped(),
        StdoutMode::Inherit => Stdio::inherit(),
    };
    let launch_err = |source: std::io::Error| WrapperError::Launch {
        program: program.to_string(),
        source,
    };

    info!("[exec] running {} {:?}", program, args);
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout_cfg)
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("[exec] failed to launch {}: {}", program, e);
            return Ok(Captured::never_started(e.to_string()));
        }
    };

    let stdout_buf = PipeBuffer::default();
    let stderr_buf = PipeBuffer::default();
    let mut readers = JoinSet::new();
    if let Some(pipe) = child.stdout.take() {
        readers.spawn(drain(pipe, stdout_buf.clone()));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.spawn(drain(pipe, stderr_buf.clone()));
    }

    let waited = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status.map_err(launch_err)?),
    };

    let (status, cancelled) = match waited {
        Some(status) => {
            join_readers(&mut readers).await.map_err(launch_err)?;
            (status, false)
        }
        None => {
            warn!("[exec] cancelled, killing {}", program);
            if let Err(e) = child.kill().await {
                warn!("[exec] could not kill {}: {}", program, e);
            }
            let status = child.wait().await.map_err(launch_err)?;
            match tokio::time::timeout(DRAIN_GRACE, join_readers(&mut readers)).await {
                Ok(Err(e)) => warn!("[exec] reading output of {} failed: {}", program, e),
                Ok(Ok(())) => {}
                Err(_) => readers.abort_all(),
            }
            (status, true)
        }
    };

    let outcome = ProcessOutcome::from(status);
    info!("[exec] {} finished with code {}", program, outcome.exit_code());
    Ok(Captured {
        outcome,
        stdout: take_buffer(&stdout_buf),
        stderr: take_buffer(&stderr_buf),
        cancelled,
    })
}

async fn drain<R>(mut pipe: R, buf: PipeBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(&chunk[..n]);
    }
}

async fn join_readers(readers: &mut JoinSet<std::io::Result<()>>) -> std::io::Result<()> {
    while let Some(joined) = readers.join_next().await {
        match joined {
            Ok(res) => res?,
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(std::io::Error::other(e)),
        }
    }
    Ok(())
}

fn take_buffer(buf: &PipeBuffer) -> Bytes {
    Bytes::from(std::mem::take(
        &mut *buf.lock().unwrap_or_else(|e| e.into_inner()),
    ))
}
