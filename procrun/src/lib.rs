//! Subprocess execution discipline (spec.md §4.C "Subprocess discipline",
//! §5 "Suspension / blocking points", Design Notes "Subprocess invocation").
//!
//! Every external invocation in `sanfabric` and `devresolver` goes through
//! [`run`]. Its one non-negotiable contract, carried over unmodified from
//! the spec: stdout and stderr are drained concurrently from a selectable
//! set, with a bounded timeout and child-kill on expiry. A single-fd reader
//! deadlocks on a chatty `iscsiadm`/`multipathd` filling its stderr pipe
//! while nothing reads it — this is the failure mode the two reader threads
//! below exist to prevent.
//!
//! The surrounding `OutputChecker`/`RunAndCheck` shape mirrors how
//! `osutils::exe` wraps `std::process::Output` for the rest of this
//! workspace's subprocess calls that don't need a bounded timeout.

use std::{
    io::Read,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Error};
use log::{debug, trace, warn};

/// Output of a subprocess run through [`run`].
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn is_success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out += &format!("stdout:\n{}\n", self.stdout);
        }
        if !self.stderr.is_empty() {
            out += &format!("stderr:\n{}\n", self.stderr);
        }
        out
    }
}

/// Runs `command`, draining stdout and stderr concurrently, and kills the
/// child if it has not exited by `timeout`. `ignorable` classifies a
/// non-zero exit as benign (e.g. iscsiadm's exit code 15, "already logged
/// in") so callers don't have to special-case it at every call site.
pub fn run(
    command: &mut Command,
    timeout: Duration,
    ignorable: impl Fn(&RunOutput) -> bool,
) -> Result<RunOutput, Error> {
    let rendered = render_command(command);
    trace!("Executing '{rendered}' (timeout {timeout:?})");

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child: Child = command
        .spawn()
        .with_context(|| format!("Failed to spawn '{rendered}'"))?;

    let stdout_pipe = child.stdout.take().expect("stdout was piped");
    let stderr_pipe = child.stderr.take().expect("stderr was piped");

    // Two reader threads form the "selectable set": each pipe is drained on
    // its own thread so neither can block waiting on the other, and the
    // result is joined back through a channel.
    let (stdout_tx, stdout_rx) = mpsc::channel();
    let (stderr_tx, stderr_rx) = mpsc::channel();
    let stdout_thread = spawn_drain(stdout_pipe, stdout_tx);
    let stderr_thread = spawn_drain(stderr_pipe, stderr_tx);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait().context("Failed to poll child status")? {
            Some(status) => break Some(status),
            None => {
                if Instant::now() >= deadline {
                    warn!("'{rendered}' exceeded {timeout:?}, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    };
    let timed_out = status.is_none();

    let stdout = stdout_rx.recv().unwrap_or_default();
    let stderr = stderr_rx.recv().unwrap_or_default();
    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    let result = RunOutput {
        status,
        stdout,
        stderr,
        timed_out,
    };

    debug!(
        "Executed '{rendered}': exit={:?} timed_out={}",
        result.exit_code(),
        result.timed_out
    );

    if result.timed_out {
        return Err(anyhow!(
            "'{rendered}' timed out after {timeout:?}\n{}",
            result.report()
        ));
    }

    if !result.is_success() && !ignorable(&result) {
        return Err(anyhow!(
            "'{rendered}' {}\n{}",
            explain_exit(result.status),
            result.report()
        ));
    }

    Ok(result)
}

/// `run` with no ignorable exit codes: any non-zero exit is fatal.
pub fn run_checked(command: &mut Command, timeout: Duration) -> Result<RunOutput, Error> {
    run(command, timeout, |_| false)
}

fn spawn_drain<R: Read + Send + 'static>(mut pipe: R, tx: mpsc::Sender<String>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    })
}

fn explain_exit(status: Option<ExitStatus>) -> String {
    match status {
        Some(s) if s.code().is_some() => format!("exited with status: {}", s.code().unwrap()),
        #[cfg(unix)]
        Some(s) => {
            use std::os::unix::process::ExitStatusExt;
            match s.signal() {
                Some(sig) => format!("was terminated by signal: {sig}"),
                None => "exited with unknown status".to_owned(),
            }
        }
        #[cfg(not(unix))]
        Some(_) => "exited with unknown status".to_owned(),
        None => "did not exit".to_owned(),
    }
}

fn render_command(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().into_owned()];
    parts.extend(command.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Validates that `s` contains only characters from `allowed` before it is
/// allowed to appear on a subprocess argv. Device names, WWIDs, and
/// user-controlled identifiers must pass through this (or a stricter
/// allow-list) before being interpolated into any command.
pub fn validate_argv_token(s: &str, allowed: impl Fn(char) -> bool) -> Result<(), Error> {
    if s.is_empty() {
        return Err(anyhow!("refusing empty argument"));
    }
    if let Some(bad) = s.chars().find(|c| !allowed(*c)) {
        return Err(anyhow!("refusing unsafe character '{bad}' in argument '{s}'"));
    }
    Ok(())
}

/// The allow-list used for device names and WWIDs throughout this
/// workspace: lowercase hex, digits, and the handful of punctuation marks
/// that appear in real `/dev` paths.
pub fn is_safe_device_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_and_captures_stdout() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = run_checked(&mut cmd, Duration::from_secs(5)).unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.is_success());
    }

    #[test]
    fn fails_on_nonzero_exit_by_default() {
        let mut cmd = Command::new("false");
        assert!(run_checked(&mut cmd, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn ignorable_predicate_swallows_known_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 15");
        let out = run(&mut cmd, Duration::from_secs(5), |o| o.exit_code() == Some(15)).unwrap();
        assert_eq!(out.exit_code(), Some(15));
    }

    #[test]
    fn kills_child_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_checked(&mut cmd, Duration::from_millis(100)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn drains_chatty_stderr_without_deadlock() {
        // Writes > a typical pipe buffer to stderr; a single-fd reader that
        // waits on stdout first would deadlock here.
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("yes err >&2 | head -c 200000 >&2; echo done");
        let out = run_checked(&mut cmd, Duration::from_secs(10)).unwrap();
        assert_eq!(out.stdout.trim(), "done");
        assert!(out.stderr.len() > 100_000);
    }

    #[test]
    fn validate_argv_token_rejects_shell_metacharacters() {
        assert!(validate_argv_token("sda1", is_safe_device_char).is_ok());
        assert!(validate_argv_token("/dev/mapper/3624a9370abc", is_safe_device_char).is_ok());
        assert!(validate_argv_token("sda1; rm -rf /", is_safe_device_char).is_err());
        assert!(validate_argv_token("$(whoami)", is_safe_device_char).is_err());
        assert!(validate_argv_token("", is_safe_device_char).is_err());
    }
}
