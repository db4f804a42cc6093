//! Child process supervision with an idle-activity clock.
//!
//! Both output streams are drained concurrently by reader threads. Every chunk
//! touches a shared [`ActivityClock`], is forwarded to the parent's own stream
//! for live visibility, and is kept (up to a limit) for parsing. The calling
//! thread polls the child at a fixed interval and kills it once the clock says
//! it has been silent for longer than the idle timeout.

use std::io::{self, Read, Write};
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Interval between idle checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Bytes of stdout/stderr kept in memory per stream.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Last time either output stream produced a byte.
///
/// Written by one reader thread per stream, read by the supervising thread.
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a stream is forwarded while it is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Passthrough {
    Stdout,
    Stderr,
    Off,
}

impl Passthrough {
    fn forward(self, chunk: &[u8]) {
        let result = match self {
            Passthrough::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(chunk).and_then(|()| out.flush())
            }
            Passthrough::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(chunk).and_then(|()| err.flush())
            }
            Passthrough::Off => Ok(()),
        };
        if let Err(err) = result {
            debug!(err = %err, "failed to forward child output");
        }
    }
}

/// Knobs for [`supervise`].
#[derive(Debug, Clone)]
pub struct SuperviseOptions {
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub output_limit_bytes: usize,
    /// Forward child output to this process's stdout/stderr.
    pub passthrough: bool,
}

impl SuperviseOptions {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            poll_interval: POLL_INTERVAL,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            passthrough: true,
        }
    }
}

/// Captured output of a child that exited on its own.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

/// How a supervised child ended.
#[derive(Debug)]
pub enum Supervised {
    Exited(CommandOutput),
    /// Killed after producing no output for `idle` (>= the idle timeout).
    IdleTimedOut { idle: Duration },
}

/// Supervise a spawned child whose stdout and stderr are piped.
///
/// Blocks until the child exits or is killed for inactivity. On an idle kill
/// the child is reaped but the reader threads are left to finish on their own,
/// since orphaned grandchildren may still hold the pipes open.
#[instrument(
    skip_all,
    fields(pid = child.id(), idle_timeout_secs = options.idle_timeout.as_secs())
)]
pub fn supervise(mut child: Child, options: &SuperviseOptions) -> io::Result<Supervised> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr was not piped"))?;

    let clock = Arc::new(ActivityClock::new());
    let (out_sink, err_sink) = if options.passthrough {
        (Passthrough::Stdout, Passthrough::Stderr)
    } else {
        (Passthrough::Off, Passthrough::Off)
    };
    let limit = options.output_limit_bytes;

    let stdout_clock = Arc::clone(&clock);
    let stdout_handle =
        thread::spawn(move || read_stream_tracked(stdout, limit, out_sink, &stdout_clock));
    let stderr_clock = Arc::clone(&clock);
    let stderr_handle =
        thread::spawn(move || read_stream_tracked(stderr, limit, err_sink, &stderr_clock));

    debug!("supervising child process");
    loop {
        if let Some(status) = child.wait_timeout(options.poll_interval)? {
            let (stdout, stdout_truncated) = join_output(stdout_handle)?;
            let (stderr, stderr_truncated) = join_output(stderr_handle)?;
            if stdout_truncated > 0 || stderr_truncated > 0 {
                warn!(stdout_truncated, stderr_truncated, "output truncated");
            }
            debug!(exit_code = ?status.code(), "child exited");
            return Ok(Supervised::Exited(CommandOutput {
                status,
                stdout,
                stderr,
                stdout_truncated,
                stderr_truncated,
            }));
        }

        let idle = clock.idle_for();
        if idle > options.idle_timeout {
            warn!(idle_secs = idle.as_secs(), "child idle past timeout, killing");
            if let Err(err) = child.kill() {
                warn!(err = %err, "failed to kill idle child");
            }
            child.wait()?;
            return Ok(Supervised::IdleTimedOut { idle });
        }
    }
}

fn join_output(
    handle: thread::JoinHandle<io::Result<(Vec<u8>, usize)>>,
) -> io::Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("output reader thread panicked")),
    }
}

fn read_stream_tracked<R: Read>(
    mut reader: R,
    limit: usize,
    passthrough: Passthrough,
    clock: &ActivityClock,
) -> io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        clock.touch();
        passthrough.forward(&chunk[..n]);

        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Last `max_bytes` of `bytes` as trimmed, lossily decoded text.
pub fn tail_text(bytes: &[u8], max_bytes: usize) -> String {
    let start = bytes.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}
