//! Child process execution with a wall-clock timeout and bounded capture.
//!
//! The child runs in its own process group on unix. On timeout the whole group
//! is killed, so processes the child started cannot keep the call alive by
//! holding its pipes open.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long readers may keep draining after the child has exited.
const READER_GRACE: Duration = Duration::from_secs(2);
const READER_POLL: Duration = Duration::from_millis(10);

/// Lowercase marker looked for on stderr.
const TRACEBACK_MARKER: &[u8] = b"traceback";

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// Traceback marker anywhere on stderr, including the dropped tail.
    pub stderr_traceback: bool,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Lossy UTF-8 stdout with a truncation notice appended when bytes were dropped.
    pub fn stdout_text(&self) -> String {
        with_notice(&self.stdout, self.stdout_truncated, "stdout")
    }

    pub fn stderr_text(&self) -> String {
        with_notice(&self.stderr, self.stderr_truncated, "stderr")
    }
}

fn with_notice(bytes: &[u8], truncated: usize, label: &str) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}

/// Case-insensitive search for [`TRACEBACK_MARKER`] over a chunked stream.
///
/// The last `marker - 1` bytes of each chunk are carried over so a marker
/// split across two reads is still found.
#[derive(Debug, Default)]
struct MarkerScan {
    carry: Vec<u8>,
    seen: bool,
}

impl MarkerScan {
    fn feed(&mut self, chunk: &[u8]) {
        if self.seen {
            return;
        }
        let mut window = std::mem::take(&mut self.carry);
        window.extend(chunk.iter().map(u8::to_ascii_lowercase));
        if window
            .windows(TRACEBACK_MARKER.len())
            .any(|w| w == TRACEBACK_MARKER)
        {
            self.seen = true;
            return;
        }
        let keep = window.len().min(TRACEBACK_MARKER.len() - 1);
        self.carry = window.split_off(window.len() - keep);
    }
}

/// What a reader thread has collected so far.
#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: usize,
    scan: MarkerScan,
}

type SharedCapture = Arc<Mutex<Capture>>;

/// Run `cmd` to completion or until `timeout`, killing it on expiry.
///
/// Both pipes are drained on reader threads while the child runs, so a chatty
/// child cannot deadlock on a full pipe. At most `output_limit_bytes` per
/// stream are kept; the rest is drained, counted and still scanned for a
/// traceback marker.
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
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e)
                .with_context(|| format!("spawn {}", cmd.get_program().to_string_lossy()));
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
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let readers = [
        spawn_reader(stdout, Arc::clone(&stdout_capture), output_limit_bytes),
        spawn_reader(stderr, Arc::clone(&stderr_capture), output_limit_bytes),
    ];

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading stdin closes the pipe; that is not our failure.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            kill_tree(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    // Leftover processes of the group may still hold the pipes.
    if !readers_done(&readers, Instant::now() + READER_GRACE) {
        warn!("output pipes still open after the command exited, killing its process group");
        kill_tree(&mut child);
        if !readers_done(&readers, Instant::now() + READER_GRACE) {
            warn!("abandoning output readers, keeping what was captured");
        }
    }
    for reader in readers {
        if reader.is_finished() {
            reader
                .join()
                .map_err(|_| anyhow!("output reader thread panicked"))?
                .context("read command output")?;
        }
    }

    let (stdout, stdout_truncated, _) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated, stderr_traceback) = take_capture(&stderr_capture);
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, stderr_traceback, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        stderr_traceback,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    capture: SharedCapture,
    limit: usize,
) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || read_stream_limited(reader, &capture, limit))
}

fn readers_done(readers: &[thread::JoinHandle<Result<()>>], deadline: Instant) -> bool {
    loop {
        if readers.iter().all(thread::JoinHandle::is_finished) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(READER_POLL);
    }
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, usize, bool) {
    let mut guard = capture.lock().unwrap_or_else(PoisonError::into_inner);
    let bytes = std::mem::take(&mut guard.bytes);
    (bytes, guard.truncated, guard.scan.seen)
}

/// Kill the child's process group, then the child itself.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        // The child leads its own group, so the group id is its pid.
        if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!(%err, "process group already gone");
        }
    }
    if let Err(err) = child.kill() {
        debug!(%err, "child already exited");
    }
}

fn read_stream_limited<R: Read>(mut reader: R, capture: &SharedCapture, limit: usize) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut guard = capture.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = limit.saturating_sub(guard.bytes.len());
        let keep = n.min(remaining);
        guard.bytes.extend_from_slice(&chunk[..keep]);
        guard.truncated += n - keep;
        guard.scan.feed(&chunk[..n]);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.stderr_text(), "err\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run");
        assert_eq!(out.stdout_text(), "hello");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_timeout(
            sh("exec sleep 5"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
    }

    #[test]
    fn bounds_captured_output() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_text().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn traceback_past_the_capture_limit_is_detected() {
        let out = run_command_with_timeout(
            sh("i=0; while [ $i -lt 200 ]; do echo 'UserWarning: layer has no CRS' >&2; \
                i=$((i+1)); done; echo 'Traceback (most recent call last):' >&2"),
            None,
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert!(out.stderr_truncated > 0);
        assert!(!String::from_utf8_lossy(&out.stderr).contains("Traceback"));
        assert!(out.stderr_traceback);
    }

    #[test]
    fn clean_stderr_has_no_traceback() {
        let out = run_command_with_timeout(
            sh("echo 'warning: slow' >&2"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(!out.stderr_traceback);
    }

    #[test]
    fn marker_split_across_reads_is_found() {
        let mut scan = MarkerScan::default();
        scan.feed(b"ValueError follows. Trace");
        assert!(!scan.seen);
        scan.feed(b"BACK (most recent call last)");
        assert!(scan.seen);

        let mut scan = MarkerScan::default();
        for byte in b"xx traceback" {
            scan.feed(&[*byte]);
        }
        assert!(scan.seen);
    }

    #[test]
    fn timeout_kills_processes_started_by_the_child() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 5; echo never"),
            None,
            Duration::from_millis(300),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[test]
    fn background_process_holding_pipes_does_not_block() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 5 & echo started"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.stdout_text(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command_with_timeout(
            Command::new("/nonexistent/geoagent-interpreter"),
            None,
            Duration::from_secs(1),
            1024,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("spawn"));
    }
}
