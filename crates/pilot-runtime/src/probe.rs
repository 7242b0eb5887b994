//! Readiness probing: deadline-driven polling over TCP, file, FIFO
//! token, or plugin-provided strategies.
//!
//! This module is the sole site of platform branching: pipe names are
//! opaque paths to everything else, FIFOs only exist on unix.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use pilot_core::manifest::{PARAM_HOST, PARAM_PATH, PARAM_PORT};
use pilot_core::{BuiltinStrategy, ChildView, ResolvedStrategy};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::{Clock, TokioClock};

/// Default pause between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Token a child writes into its readiness pipe.
const PIPE_TOKEN: &str = "ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Ready,
    TimedOut,
}

/// Polls a strategy until it reports ready or the deadline passes.
///
/// The deadline is re-checked before every sleep, so a slow probe can
/// overrun it by at most one poll interval plus its own blocking cost.
#[derive(Clone)]
pub struct ReadinessProber<C: Clock = TokioClock> {
    clock: C,
    poll_interval: Duration,
}

impl ReadinessProber {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_clock(poll_interval, TokioClock)
    }
}

impl<C: Clock> ReadinessProber<C> {
    pub fn with_clock(poll_interval: Duration, clock: C) -> Self {
        Self {
            clock,
            poll_interval,
        }
    }

    pub async fn probe(
        &self,
        view: &ChildView,
        strategy: &ResolvedStrategy,
        deadline: Instant,
    ) -> ProbeVerdict {
        let mut pipe = PipeReader::default();
        loop {
            if self.attempt(view, strategy, &mut pipe).await {
                debug!(process = %view.name, "readiness probe succeeded");
                return ProbeVerdict::Ready;
            }
            let now = self.clock.now();
            if now >= deadline {
                return ProbeVerdict::TimedOut;
            }
            let nap = self.poll_interval.min(deadline - now);
            self.clock.sleep(nap).await;
        }
    }

    async fn attempt(
        &self,
        view: &ChildView,
        strategy: &ResolvedStrategy,
        pipe: &mut PipeReader,
    ) -> bool {
        match strategy {
            ResolvedStrategy::Builtin(BuiltinStrategy::Tcp) => {
                probe_tcp(view, self.poll_interval).await
            }
            ResolvedStrategy::Builtin(BuiltinStrategy::File) => probe_file(view),
            ResolvedStrategy::Builtin(BuiltinStrategy::Pipe) => probe_pipe(view, pipe),
            ResolvedStrategy::Custom(probe) => probe(view, self.poll_interval),
        }
    }
}

// ─── TCP ─────────────────────────────────────────────────────────

async fn probe_tcp(view: &ChildView, attempt_timeout: Duration) -> bool {
    let Some(port) = view.ready_params.get(PARAM_PORT).and_then(|v| v.as_u64()) else {
        return false;
    };
    let host = view
        .ready_params
        .get(PARAM_HOST)
        .and_then(|v| v.as_str())
        .unwrap_or("127.0.0.1");
    let addr = format!("{host}:{port}");
    // Any connect error is a transient failure, not a probe error.
    matches!(
        tokio::time::timeout(attempt_timeout, TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

// ─── File ────────────────────────────────────────────────────────

fn probe_file(view: &ChildView) -> bool {
    let Some(path) = view.ready_params.get(PARAM_PATH).and_then(|v| v.as_str()) else {
        return false;
    };
    // Permission errors count as transient.
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

// ─── Pipe ────────────────────────────────────────────────────────

/// Accumulates bytes from the readiness FIFO across polls. The read
/// end stays open so a token written between polls is not lost.
#[derive(Default)]
struct PipeReader {
    file: Option<std::fs::File>,
    buf: String,
}

impl PipeReader {
    fn poll(&mut self, path: &str) -> bool {
        if self.file.is_none() {
            self.file = open_pipe_reader(Path::new(path)).ok();
        }
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        let mut chunk = [0u8; 256];
        loop {
            match file.read(&mut chunk) {
                // No writer connected right now; try again next poll.
                Ok(0) => break,
                Ok(n) => self.buf.push_str(&String::from_utf8_lossy(&chunk[..n])),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        self.buf.trim_end() == PIPE_TOKEN
    }
}

fn probe_pipe(view: &ChildView, pipe: &mut PipeReader) -> bool {
    let Some(path) = view.ready_params.get(PARAM_PATH).and_then(|v| v.as_str()) else {
        return false;
    };
    pipe.poll(path)
}

#[cfg(unix)]
fn open_pipe_reader(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_pipe_reader(_path: &Path) -> std::io::Result<std::fs::File> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "pipe readiness requires a unix platform",
    ))
}

/// Create the readiness FIFO for a pipe-strategy child. Called before
/// its pre-start hooks run; any stale file at the path is replaced.
#[cfg(unix)]
pub fn create_pipe(path: &Path) -> std::io::Result<()> {
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    if path.exists() {
        std::fs::remove_file(path)?;
    }
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub fn create_pipe(_path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "pipe readiness requires a unix platform",
    ))
}

/// Remove a readiness FIFO once its child has exited.
pub fn remove_pipe(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), %err, "could not unlink readiness pipe");
        }
    }
}
