use crate::config::StdioPolicy;
use crate::error::GatewayError;
use crate::resolver::ScriptTarget;
use log::{debug, warn};
use mio::unix::pipe::Receiver;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How long `kill` waits for a killed child before leaving it to the reaper.
const REAP_GRACE: Duration = Duration::from_millis(50);

/// Starts scripts with their stdout wired to a pipe the event loop can poll.
pub struct Launcher {
    interpreter: Option<String>,
    stdin: StdioPolicy,
    stderr: StdioPolicy,
    reaper: Reaper,
}

impl Launcher {
    pub fn new(interpreter: Option<String>, stdin: StdioPolicy, stderr: StdioPolicy) -> Self {
        Launcher {
            interpreter,
            stdin,
            stderr,
            reaper: Reaper::default(),
        }
    }

    /// Collects killed children that had not exited yet when they were
    /// dropped. Returns how many are still outstanding.
    pub fn reap_orphans(&self) -> usize {
        self.reaper.reap()
    }

    /// `<interpreter> <script> <args...>`, or `<script> <args...>` without an
    /// interpreter. Arguments are passed as a list; no shell is involved.
    /// The child leads a new process group so it can be killed with
    /// everything it starts.
    pub fn command(&self, target: &ScriptTarget, args: &[String]) -> Command {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&target.path);
                cmd
            }
            None => Command::new(&target.path),
        };
        command
            .args(args)
            .stdin(stdio(self.stdin))
            .stdout(Stdio::piped())
            .stderr(stdio(self.stderr))
            .process_group(0);
        command
    }

    pub fn spawn(&self, target: &ScriptTarget, args: &[String]) -> Result<ScriptProcess, GatewayError> {
        let launch_error = |source: io::Error| GatewayError::Launch {
            script: target.name.clone(),
            source,
        };

        let child = self.command(target, args).spawn().map_err(launch_error)?;
        let mut process = ScriptProcess {
            child,
            output: None,
            status: None,
            reaper: self.reaper.clone(),
        };

        // From here on `process` is dropped (killed and reaped) on any error.
        let stdout = process
            .child
            .stdout
            .take()
            .ok_or_else(|| launch_error(io::Error::new(io::ErrorKind::Other, "stdout was not captured")))?;
        let receiver = Receiver::from(stdout);
        receiver.set_nonblocking(true).map_err(launch_error)?;
        process.output = Some(receiver);

        debug!("spawned {} as pid {}", target.path.display(), process.id());
        Ok(process)
    }
}

fn stdio(policy: StdioPolicy) -> Stdio {
    match policy {
        StdioPolicy::Inherit => Stdio::inherit(),
        StdioPolicy::Discard => Stdio::null(),
    }
}

/// Pids of killed children still waiting to be collected.
#[derive(Clone, Default)]
struct Reaper {
    orphans: Arc<Mutex<Vec<Pid>>>,
}

impl Reaper {
    fn adopt(&self, pid: Pid) {
        match self.orphans.lock() {
            Ok(mut orphans) => orphans.push(pid),
            Err(_) => warn!("reaper lock poisoned; pid {} stays a zombie", pid),
        }
    }

    fn reap(&self) -> usize {
        let Ok(mut orphans) = self.orphans.lock() else {
            return 0;
        };
        orphans.retain(|&pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => true,
            Ok(status) => {
                debug!("reaped orphan {}: {:?}", pid, status);
                false
            }
            Err(e) => {
                warn!("cannot reap pid {}: {}", pid, e);
                false
            }
        });
        orphans.len()
    }
}

/// Exclusive owner of one child process and its stdout pipe.
///
/// Dropping a process that has not been reaped kills its process group, so
/// every path out of a request releases the script and its descendants.
pub struct ScriptProcess {
    child: Child,
    output: Option<Receiver>,
    status: Option<ExitStatus>,
    reaper: Reaper,
}

impl ScriptProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn output(&mut self) -> Option<&mut Receiver> {
        self.output.as_mut()
    }

    /// Detaches the pipe, e.g. to deregister it after end-of-stream.
    pub fn take_output(&mut self) -> Option<Receiver> {
        self.output.take()
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?;
        }
        Ok(self.status)
    }

    /// SIGKILLs the child's process group and reaps the child if it exits
    /// within `REAP_GRACE`. `None` means it is still dying.
    pub fn kill(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        match killpg(self.pid(), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => return Err(errno.into()),
        }

        let give_up = Instant::now() + REAP_GRACE;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= give_up {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

impl Drop for ScriptProcess {
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        match self.kill() {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("pid {} not dead yet; leaving it to the reaper", self.child.id());
                self.reaper.adopt(self.pid());
            }
            Err(e) => {
                warn!("failed to kill pid {}: {}", self.child.id(), e);
                self.reaper.adopt(self.pid());
            }
        }
    }
}
