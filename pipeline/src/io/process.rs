//! Child processes with a wall-clock timeout and bounded captured output.
//!
//! Both bounds are enforced: the child is killed when the timeout elapses or
//! when either stream produces more than the byte limit. On Unix the child
//! leads its own process group, and the whole group is killed once the child
//! is done, so no descendant outlives the call.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long readers may keep draining after the process group is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Set when a stream passed the byte limit and the child was killed.
    pub output_limit_exceeded: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&truncated_notice("stdout", self.stdout_truncated));
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        text.push_str(&truncated_notice("stderr", self.stderr_truncated));
        text
    }

    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.output_limit_exceeded
    }
}

fn truncated_notice(stream: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{stream} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read and stdin is written concurrently while the child runs. At
/// most `output_limit_bytes` per stream are kept; the first byte past the
/// limit kills the child. Spawn failures are returned as errors.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    own_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let overflow = Arc::new(AtomicBool::new(false));
    let stdout_reader = StreamReader::spawn(stdout, output_limit_bytes, Arc::clone(&overflow));
    let stderr_reader = StreamReader::spawn(stderr, output_limit_bytes, Arc::clone(&overflow));

    if let Some(input) = stdin {
        let child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        spawn_stdin_writer(child_stdin, input.to_vec());
    }

    let waited = wait_bounded(&mut child, timeout, &overflow);
    kill_process_group(&child);
    let (status, timed_out) = waited?;
    let output_limit_exceeded = overflow.load(Ordering::SeqCst);

    let (stdout, stdout_truncated) = stdout_reader.finish("stdout")?;
    let (stderr, stderr_truncated) = stderr_reader.finish("stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, output_limit_exceeded, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        output_limit_exceeded,
    })
}

/// Wait until the child exits, the deadline passes, or a reader flags overflow.
fn wait_bounded(
    child: &mut Child,
    timeout: Duration,
    overflow: &AtomicBool,
) -> Result<(ExitStatus, bool)> {
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            return Ok((kill_and_reap(child)?, true));
        }
        if overflow.load(Ordering::SeqCst) {
            warn!("command exceeded output limit, killing");
            return Ok((kill_and_reap(child)?, false));
        }
        let slice = POLL_INTERVAL.min(deadline - now);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok((status, false));
        }
    }
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    kill_process_group(child);
    if let Err(e) = child.kill() {
        // Already exited between the last poll and the kill.
        debug!(err = %e, "kill command");
    }
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// SIGKILL everything left in the child's process group.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "killed process group"),
        // Nothing left in the group.
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(err = %e, pgid, "kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Feed stdin off the calling thread so a child that never reads cannot stall
/// the timeout. The writer ends when the pipe closes.
fn spawn_stdin_writer(mut child_stdin: ChildStdin, input: Vec<u8>) {
    thread::spawn(move || {
        if let Err(e) = child_stdin.write_all(&input) {
            // A child that exits without reading its input is reported by its status.
            warn!(err = %e, "write stdin");
        }
    });
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Reader thread draining one stream into a shared, bounded buffer.
struct StreamReader {
    captured: Arc<Mutex<Captured>>,
    handle: thread::JoinHandle<Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize, overflow: Arc<AtomicBool>) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&captured);
        let handle = thread::spawn(move || read_stream_limited(reader, limit, &overflow, &sink));
        Self { captured, handle }
    }

    /// Give the reader a short grace period to hit end of stream, then take
    /// whatever it collected. A pipe held open by an escaped process is left
    /// to its detached reader.
    fn finish(self, stream: &str) -> Result<(Vec<u8>, usize)> {
        let deadline = Instant::now() + READER_GRACE;
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            match self.handle.join() {
                Ok(result) => result.with_context(|| format!("read {stream}"))?,
                Err(_) => return Err(anyhow!("{stream} reader thread panicked")),
            }
        } else {
            warn!(stream, "stream still open after the command ended, detaching reader");
        }
        let mut captured = self
            .captured
            .lock()
            .map_err(|_| anyhow!("{stream} buffer poisoned"))?;
        Ok((std::mem::take(&mut captured.bytes), captured.truncated))
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    overflow: &AtomicBool,
    sink: &Mutex<Captured>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = sink.lock().map_err(|_| anyhow!("output buffer poisoned"))?;
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        if keep < n {
            captured.truncated += n - keep;
            overflow.store(true, Ordering::SeqCst);
            // Dropping the reader closes the pipe so writers stop instead of blocking.
            return Ok(());
        }
    }
}
