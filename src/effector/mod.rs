//! Narrow interface through which the engine touches the host.
//!
//! The network engines only describe commands; a [`SystemEffector`] decides
//! whether and how they run. Dry-run mode and tests swap the effector instead
//! of branching inside every mutating step.

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::rc::Rc;

use tracing::{debug, info};

use crate::error::{CniError, CniResult};

/// A command line to run on the host, optionally inside a network namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Network namespace to enter before running (Linux only)
    pub netns: Option<PathBuf>,
}

impl HostCommand {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            netns: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn in_netns<P: Into<PathBuf>>(mut self, netns: P) -> Self {
        self.netns = Some(netns.into());
        self
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(netns) = &self.netns {
            write!(f, "[netns {}] ", netns.display())?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

pub trait SystemEffector {
    /// Run a command that mutates host state
    fn execute(&self, cmd: &HostCommand) -> CniResult<()>;

    /// Run a read-only query and return its stdout
    fn capture(&self, cmd: &HostCommand) -> CniResult<String>;
}

impl<E: SystemEffector + ?Sized> SystemEffector for Box<E> {
    fn execute(&self, cmd: &HostCommand) -> CniResult<()> {
        (**self).execute(cmd)
    }

    fn capture(&self, cmd: &HostCommand) -> CniResult<String> {
        (**self).capture(cmd)
    }
}

/// Runs commands for real
#[derive(Debug, Default, Clone, Copy)]
pub struct HostEffector;

impl HostEffector {
    fn output(&self, cmd: &HostCommand) -> CniResult<Output> {
        debug!("running {}", cmd);
        let run = || {
            Command::new(&cmd.program)
                .args(&cmd.args)
                .output()
                .map_err(|e| CniError::wrap(format!("failed to execute {}", cmd.program), e.into()))
        };
        let output = match &cmd.netns {
            Some(netns) => in_netns(netns, run)?,
            None => run()?,
        };
        if !output.status.success() {
            return Err(CniError::HostCommand {
                command: cmd.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl SystemEffector for HostEffector {
    fn execute(&self, cmd: &HostCommand) -> CniResult<()> {
        self.output(cmd).map(|_| ())
    }

    fn capture(&self, cmd: &HostCommand) -> CniResult<String> {
        let output = self.output(cmd)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Execute a function inside a network namespace
#[cfg(target_os = "linux")]
fn in_netns<F, T>(netns_path: &std::path::Path, f: F) -> CniResult<T>
where
    F: FnOnce() -> CniResult<T>,
{
    use nix::fcntl::{open, OFlag};
    use nix::sched::{setns, CloneFlags};
    use nix::sys::stat::Mode;
    use nix::unistd::close;

    let nix_err = |msg: String| move |e: nix::Error| CniError::wrap(msg, std::io::Error::from(e).into());

    // Keep a handle on the current namespace so we can come back
    let orig_fd = open("/proc/self/ns/net", OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(nix_err("failed to open current network namespace".to_string()))?;

    let netns_fd = match open(netns_path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = close(orig_fd);
            return Err(nix_err(format!(
                "failed to open network namespace {}",
                netns_path.display()
            ))(e));
        }
    };

    let entered = setns(netns_fd, CloneFlags::CLONE_NEWNET).map_err(nix_err(format!(
        "failed to enter network namespace {}",
        netns_path.display()
    )));
    let _ = close(netns_fd);

    let result = entered.and_then(|_| f());

    let restored = setns(orig_fd, CloneFlags::CLONE_NEWNET)
        .map_err(nix_err("failed to restore original network namespace".to_string()));
    let _ = close(orig_fd);

    // A failure to restore trumps whatever the closure returned
    restored?;
    result
}

#[cfg(not(target_os = "linux"))]
fn in_netns<F, T>(_netns_path: &std::path::Path, _f: F) -> CniResult<T>
where
    F: FnOnce() -> CniResult<T>,
{
    Err(CniError::Unsupported("entering a network namespace".to_string()))
}

/// Skips every mutating command and forwards queries to `inner`
#[derive(Debug, Default)]
pub struct DryRunEffector<E> {
    inner: E,
}

impl<E: SystemEffector> DryRunEffector<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: SystemEffector> SystemEffector for DryRunEffector<E> {
    fn execute(&self, cmd: &HostCommand) -> CniResult<()> {
        info!("dry run: skipping {}", cmd);
        Ok(())
    }

    fn capture(&self, cmd: &HostCommand) -> CniResult<String> {
        self.inner.capture(cmd)
    }
}

#[derive(Debug, Default)]
struct Recording {
    executed: Vec<HostCommand>,
    captured: Vec<HostCommand>,
    responses: Vec<(String, String)>,
    failures: Vec<String>,
}

/// Records every command and answers queries from canned responses.
///
/// Clones share the same log, so a test can keep one handle while the engine
/// owns another. Responses and failures match on the rendered command line
/// prefix.
#[derive(Debug, Default, Clone)]
pub struct RecordingEffector {
    inner: Rc<RefCell<Recording>>,
}

impl RecordingEffector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries starting with `prefix` with `output`
    pub fn respond<P: Into<String>, O: Into<String>>(self, prefix: P, output: O) -> Self {
        self.inner
            .borrow_mut()
            .responses
            .push((prefix.into(), output.into()));
        self
    }

    /// Fail commands starting with `prefix`
    pub fn fail<P: Into<String>>(self, prefix: P) -> Self {
        self.inner.borrow_mut().failures.push(prefix.into());
        self
    }

    pub fn executed(&self) -> Vec<HostCommand> {
        self.inner.borrow().executed.clone()
    }

    pub fn captured(&self) -> Vec<HostCommand> {
        self.inner.borrow().captured.clone()
    }

    /// Rendered mutating commands, in order
    pub fn executed_lines(&self) -> Vec<String> {
        self.executed().iter().map(ToString::to_string).collect()
    }

    fn check_failure(&self, line: &str) -> CniResult<()> {
        if self
            .inner
            .borrow()
            .failures
            .iter()
            .any(|p| line.starts_with(p.as_str()))
        {
            return Err(CniError::HostCommand {
                command: line.to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl SystemEffector for RecordingEffector {
    fn execute(&self, cmd: &HostCommand) -> CniResult<()> {
        self.inner.borrow_mut().executed.push(cmd.clone());
        self.check_failure(&cmd.to_string())
    }

    fn capture(&self, cmd: &HostCommand) -> CniResult<String> {
        self.inner.borrow_mut().captured.push(cmd.clone());
        let line = cmd.to_string();
        self.check_failure(&line)?;
        Ok(self
            .inner
            .borrow()
            .responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}
