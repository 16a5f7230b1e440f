// src/exec.rs

//! Shell execution seam for the mount/chroot/USB machinery
//!
//! The pipeline never touches loop devices, chroots, or the USB stack
//! directly; every such step is a shell command issued through
//! [`ExecEnvironment`]. Production uses [`HostExec`]; tests script the
//! whole pipeline against [`MockExec`].

use std::collections::VecDeque;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

/// Outcome of one shell command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout and stderr interleaved for log lines and error messages
    pub fn merged(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Where mount/chroot/USB commands run
pub trait ExecEnvironment: Send + Sync {
    /// Run a shell command, waiting at most `timeout`
    fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Copy a local file into the environment
    fn copy_in(&self, local: &Path, remote: &str, timeout: Duration) -> Result<()>;

    /// Pass the USB device `vid:pid` through to the environment.
    ///
    /// Default is a no-op for environments where the device sits on the
    /// local bus already; pass-through environments override this.
    fn attach_device(&self, vid_pid: &str, _timeout: Duration) -> Result<()> {
        debug!("attach_device({}) is a no-op here", vid_pid);
        Ok(())
    }

    /// Detach the USB device from the environment
    fn detach_device(&self, vid_pid: &str, _timeout: Duration) -> Result<()> {
        debug!("detach_device({}) is a no-op here", vid_pid);
        Ok(())
    }

    /// Run and fail unless the command exits zero
    fn run_ok(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let output = self.run(command, timeout)?;
        if !output.success() {
            return Err(Error::ExternalTool(format!(
                "command failed ({}): {}\n{}",
                output.code,
                command,
                output.merged()
            )));
        }
        Ok(output)
    }
}

/// Runs commands on the local host through `bash -c`
#[derive(Debug, Default)]
pub struct HostExec;

impl HostExec {
    pub fn new() -> Self {
        Self
    }
}

impl ExecEnvironment for HostExec {
    fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        debug!("exec: {}", command);
        let mut child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ExternalTool(format!("failed to spawn {:?}: {}", command, e)))?;

        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                warn!("command timed out after {:?}, killing: {}", timeout, command);
                child.kill().ok();
                child.wait().ok();
                return Err(Error::ExternalTool(format!(
                    "command timed out after {:?}: {}",
                    timeout, command
                )));
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            std::io::Read::read_to_string(&mut pipe, &mut stdout)?;
        }
        if let Some(mut pipe) = child.stderr.take() {
            std::io::Read::read_to_string(&mut pipe, &mut stderr)?;
        }

        Ok(ExecOutput {
            code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    fn copy_in(&self, local: &Path, remote: &str, timeout: Duration) -> Result<()> {
        self.run_ok(
            &format!("cp -f {} {}", shell_quote(&local.to_string_lossy()), shell_quote(remote)),
            timeout,
        )?;
        Ok(())
    }
}

/// Single-quote a string for safe interpolation into `bash -c`
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Scripted environment for tests: responses are matched against command
/// substrings, in order of registration; unmatched commands succeed with
/// empty output
#[derive(Default)]
pub struct MockExec {
    responses: Mutex<VecDeque<(String, ExecOutput)>>,
    history: Mutex<Vec<String>>,
}

impl MockExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next command containing `pattern`
    pub fn expect(&self, pattern: &str, output: ExecOutput) {
        self.responses
            .lock()
            .unwrap()
            .push_back((pattern.to_string(), output));
    }

    pub fn expect_ok(&self, pattern: &str, stdout: &str) {
        self.expect(
            pattern,
            ExecOutput {
                code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn expect_fail(&self, pattern: &str, code: i32, stderr: &str) {
        self.expect(
            pattern,
            ExecOutput {
                code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Every command the pipeline issued, in order
    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }
}

impl ExecEnvironment for MockExec {
    fn run(&self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.history.lock().unwrap().push(command.to_string());

        let mut responses = self.responses.lock().unwrap();
        if let Some(pos) = responses.iter().position(|(p, _)| command.contains(p)) {
            let (_, output) = responses.remove(pos).unwrap();
            return Ok(output);
        }
        Ok(ExecOutput::default())
    }

    fn copy_in(&self, local: &Path, remote: &str, _timeout: Duration) -> Result<()> {
        self.history
            .lock()
            .unwrap()
            .push(format!("copy {} {}", local.display(), remote));
        Ok(())
    }

    fn attach_device(&self, vid_pid: &str, _timeout: Duration) -> Result<()> {
        self.history.lock().unwrap().push(format!("attach {}", vid_pid));
        Ok(())
    }

    fn detach_device(&self, vid_pid: &str, _timeout: Duration) -> Result<()> {
        self.history.lock().unwrap().push(format!("detach {}", vid_pid));
        Ok(())
    }
}
