//! Child-process helpers shared by the load and measurement modules.
//!
//! Modules never block on a child for long: processes are spawned, checked
//! with `try_wait`, and on cleanup sent a signal followed by a bounded wait
//! and, if needed, `SIGKILL`.

use crate::config::RunConfig;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const REAP_POLL: Duration = Duration::from_millis(50);

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Where a module's child output goes
#[derive(Debug)]
pub struct OutputFiles {
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl OutputFiles {
    /// `<logdir>/<module>.stdout|stderr` when logging is enabled, else `/dev/null`
    ///
    /// Files are opened in append mode so restarted processes keep one log.
    pub fn for_module(run: &RunConfig, module: &str) -> io::Result<Self> {
        if !run.logging {
            return Ok(Self::null());
        }
        let logdir = run.logdir();
        std::fs::create_dir_all(&logdir)?;
        let open = |suffix: &str| -> io::Result<File> {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(logdir.join(format!("{}.{}", module, suffix)))
        };
        Ok(Self {
            stdout: Stdio::from(open("stdout")?),
            stderr: Stdio::from(open("stderr")?),
        })
    }

    pub fn null() -> Self {
        Self {
            stdout: Stdio::null(),
            stderr: Stdio::null(),
        }
    }
}

/// Spawn `cmdline` with stdin closed and output sent to `output`
pub fn spawn(cmdline: &CommandLine, output: OutputFiles, dir: Option<&Path>) -> io::Result<Child> {
    let mut command = cmdline.to_command();
    command
        .stdin(Stdio::null())
        .stdout(output.stdout)
        .stderr(output.stderr);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    debug!("spawning: {}", cmdline);
    command.spawn()
}

/// Whether the child has not exited yet
pub fn is_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Send a signal to a child process
pub fn signal(child: &Child, sig: Signal) -> io::Result<()> {
    let pid = Pid::from_raw(child.id() as i32);
    kill(pid, sig).map_err(io::Error::from)
}

/// Ask a child to exit with `sig`, then kill it if it outlives `grace`
///
/// Always reaps the child. Returns its exit status when one was collected.
pub fn terminate(child: &mut Child, sig: Signal, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    if sig != Signal::SIGKILL {
        signal(child, sig)?;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                debug!("pid {} exited after {}: {}", child.id(), sig, status);
                return Ok(status);
            }
            thread::sleep(REAP_POLL);
        }
        warn!(
            "pid {} ignored {} for {:?}; killing it",
            child.id(),
            sig,
            grace
        );
    }
    child.kill()?;
    child.wait()
}

/// Spawn failure caused by the system running out of memory
pub fn is_out_of_memory(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOMEM)
}

/// Locate an executable by name on `PATH`, or check an explicit path
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if name.contains('/') {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
