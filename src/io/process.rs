//! Child process execution with timeouts, bounded output, and
//! cooperative cancellation.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

use crate::core::cancel::{CancelToken, Cancelled};

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run a command with a timeout, capturing stdout/stderr without risking
/// pipe deadlocks.
///
/// Output is read concurrently while the child runs; `output_limit_bytes`
/// bounds what is kept in memory (excess bytes are drained and counted).
/// The wait is sliced so `token` cancellation is observed promptly; a
/// cancelled or timed-out child is killed before returning.
pub fn run_command_with_timeout(
    mut cmd: Command,
    token: &CancelToken,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    token.check()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    const SLICE: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        if token.is_cancelled() {
            child.kill().context("kill cancelled command")?;
            child.wait().context("wait command after cancel")?;
            // Drain the reader threads so the pipes close cleanly.
            let _ = join_output(stdout_handle);
            let _ = join_output(stderr_handle);
            return Err(Cancelled.into());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            timed_out = true;
            child.kill().context("kill timed out command")?;
            break child.wait().context("wait command after kill")?;
        }
        match child
            .wait_timeout(remaining.min(SLICE))
            .context("wait for command")?
        {
            Some(status) => break status,
            None => continue,
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = run_command_with_timeout(
            cmd,
            &CancelToken::new(),
            Duration::from_secs(5),
            64 * 1024,
        )
        .expect("run");

        assert_eq!(output.exit_code(), 3);
        assert_eq!(output.stdout_lossy().trim(), "out");
        assert_eq!(output.stderr_lossy().trim(), "err");
        assert!(!output.timed_out);
    }

    #[test]
    fn enforces_output_limit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "head -c 100000 /dev/zero"]);
        let output =
            run_command_with_timeout(cmd, &CancelToken::new(), Duration::from_secs(5), 1000)
                .expect("run");

        assert_eq!(output.stdout.len(), 1000);
        assert_eq!(output.stdout_truncated, 99_000);
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let start = Instant::now();
        let output =
            run_command_with_timeout(cmd, &CancelToken::new(), Duration::from_millis(200), 1024)
                .expect("run");

        assert!(output.timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancelled_token_aborts_before_spawn() {
        let token = CancelToken::new();
        token.cancel();
        let err = run_command_with_timeout(
            Command::new("true"),
            &token,
            Duration::from_secs(1),
            1024,
        )
        .expect_err("cancelled");
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }
}
