//! Plugin process launch, termination and crash supervision.
//!
//! [`PluginLauncher`] is the seam between the manager and the operating
//! system: production code uses [`SystemLauncher`], tests substitute doubles
//! that run plugins in-process.

mod supervisor;

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use otelplug_ipc::IpcAddress;
use tracing::{debug, warn};

pub(crate) use supervisor::Supervisor;

pub(crate) const PROCESS_TARGET: &str = "otelplug_host::process";

const EXIT_POLL: Duration = Duration::from_millis(10);

/// How a plugin process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited with a status code.
    Code(i32),
    /// Terminated by a signal.
    Signal(i32),
    /// Ended without a reportable status.
    Unknown,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal),
            (None, None) => Self::Unknown,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit status {code}"),
            Self::Signal(signal) => write!(f, "terminated by signal {signal}"),
            Self::Unknown => f.write_str("exited"),
        }
    }
}

/// A running plugin process.
pub trait PluginProcess: Send + Sync + fmt::Debug {
    /// Operating-system process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check; reaps the process once it has exited.
    fn try_wait(&self) -> io::Result<Option<ProcessExit>>;

    /// Requests a graceful stop, escalating to a kill after `grace`, and
    /// reaps the process.
    fn terminate(&self, grace: Duration) -> io::Result<ProcessExit>;

    /// Kills and reaps the process immediately.
    fn kill(&self) -> io::Result<ProcessExit>;
}

/// Starts plugin processes.
pub trait PluginLauncher: Send + Sync {
    /// Launches `binary` so that it connects to `address`.
    fn launch(&self, binary: &Utf8Path, address: &IpcAddress)
    -> io::Result<Box<dyn PluginProcess>>;
}

/// Launches plugins as child processes with `--ipc <address>`.
///
/// Plugin stdout is discarded and stderr is inherited so plugin logs reach
/// the host's log stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl PluginLauncher for SystemLauncher {
    fn launch(
        &self,
        binary: &Utf8Path,
        address: &IpcAddress,
    ) -> io::Result<Box<dyn PluginProcess>> {
        let child = Command::new(binary.as_std_path())
            .arg("--ipc")
            .arg(address.path().as_std_path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;
        debug!(
            target: PROCESS_TARGET,
            binary = %binary,
            pid = child.id(),
            "plugin process spawned"
        );
        Ok(Box::new(ChildProcess::new(child)))
    }
}

#[derive(Debug)]
struct ChildState {
    child: Child,
    exit: Option<ProcessExit>,
}

/// A plugin running as a child process.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    state: Mutex<ChildState>,
}

impl ChildProcess {
    /// Takes ownership of a spawned child.
    #[must_use]
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            state: Mutex::new(ChildState { child, exit: None }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        let raw = i32::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn wait_until(&self, deadline: Instant) -> io::Result<Option<ProcessExit>> {
        loop {
            if let Some(exit) = self.try_wait()? {
                return Ok(Some(exit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL.min(deadline - now));
        }
    }
}

impl PluginProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&self) -> io::Result<Option<ProcessExit>> {
        let mut state = self.state();
        if let Some(exit) = state.exit {
            return Ok(Some(exit));
        }
        let observed = state.child.try_wait()?.map(ProcessExit::from);
        state.exit = observed;
        Ok(observed)
    }

    fn terminate(&self, grace: Duration) -> io::Result<ProcessExit> {
        if let Some(exit) = self.try_wait()? {
            return Ok(exit);
        }
        self.signal(Signal::SIGTERM)?;
        let deadline = Instant::now().checked_add(grace).unwrap_or_else(Instant::now);
        if let Some(exit) = self.wait_until(deadline)? {
            debug!(target: PROCESS_TARGET, pid = self.pid, %exit, "plugin exited after SIGTERM");
            return Ok(exit);
        }
        warn!(
            target: PROCESS_TARGET,
            pid = self.pid,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "plugin ignored SIGTERM, killing"
        );
        self.kill()
    }

    fn kill(&self) -> io::Result<ProcessExit> {
        let mut state = self.state();
        if let Some(exit) = state.exit {
            return Ok(exit);
        }
        if let Err(error) = state.child.kill()
            && error.kind() != io::ErrorKind::InvalidInput
        {
            return Err(error);
        }
        let exit = ProcessExit::from(state.child.wait()?);
        state.exit = Some(exit);
        Ok(exit)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.exit.is_some() {
            return;
        }
        if let Err(error) = state.child.kill() {
            warn!(
                target: PROCESS_TARGET,
                pid = self.pid,
                error = %error,
                "failed to kill plugin process on drop"
            );
        }
        if let Err(error) = state.child.wait() {
            warn!(
                target: PROCESS_TARGET,
                pid = self.pid,
                error = %error,
                "failed to reap plugin process on drop"
            );
        }
    }
}

#[cfg(test)]
mod tests;
