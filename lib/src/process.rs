//! Subprocess supervisor.
//!
//! `Task` is the synchronous entry point, built the way `lib/src/task.rs`
//! shapes its own `Task`: a description for logging, an
//! `std::process::Command`, and `run()`/`read()` terminal methods. It must
//! only be called from contexts that know the whole system is idle (daemon
//! startup, or a short-lived tool invocation) — it blocks the caller.
//!
//! `Supervisor` adds the asynchronous path: forked children are tracked in
//! an async-list keyed by pid, their stdout (if captured) is drained
//! through the waitset as the read end becomes readable, and SIGCHLD is
//! funnelled through a self-pipe so reaping happens inside the waitset
//! dispatch loop rather than in signal context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::{Command, Stdio};
use std::rc::Rc;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use rustix::event::PollFlags;

use crate::error::{Error, Result};
use crate::waitset::Waitset;

const INITIAL_STDOUT_BUF: usize = 4096;

/// A synchronous, fire-and-forget command.
pub struct Task {
    description: String,
    quiet: bool,
    cmd: Command,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("description", &self.description).finish()
    }
}

impl Task {
    pub fn new(description: impl Into<String>, exe: impl AsRef<std::ffi::OsStr>) -> Self {
        let mut cmd = Command::new(exe);
        cmd.stdin(Stdio::null());
        Self {
            description: description.into(),
            quiet: false,
            cmd,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn args<S: AsRef<std::ffi::OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Run to completion; non-zero exit is a [`Error::SubprocessFailure`].
    pub fn run(mut self) -> Result<()> {
        if !self.quiet {
            tracing::debug!("{}", self.description);
        }
        tracing::trace!(cmd = ?self.cmd, "exec");
        let status = self.cmd.status()?;
        if !status.success() {
            return Err(Error::SubprocessFailure {
                argv0: self.description,
                status: status.to_string(),
            });
        }
        Ok(())
    }

    /// Run to completion and capture stdout as UTF-8.
    pub fn read(mut self) -> Result<String> {
        if !self.quiet {
            tracing::debug!("{}", self.description);
        }
        self.cmd.stdout(Stdio::piped());
        let child = self.cmd.spawn()?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::SubprocessFailure {
                argv0: self.description,
                status: output.status.to_string(),
            });
        }
        String::from_utf8(output.stdout)
            .map_err(|e| Error::Format(format!("non-UTF-8 output: {e}")))
    }

    /// Convenience wrapper matching the original's `run_simple`.
    pub fn run_simple<'a>(
        description: impl Into<String>,
        exe: impl AsRef<std::ffi::OsStr>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        Task::new(description, exe).args(args).run()
    }
}

/// Growable stdout buffer matching the original's doubling-from-4KiB
/// strategy.
#[derive(Debug, Default, Clone)]
pub struct StdoutBuffer(Vec<u8>);

impl StdoutBuffer {
    fn extend(&mut self, data: &[u8]) {
        if self.0.capacity() < self.0.len() + data.len() {
            let mut new_cap = self.0.capacity().max(INITIAL_STDOUT_BUF);
            while new_cap < self.0.len() + data.len() {
                new_cap *= 2;
            }
            self.0.reserve(new_cap - self.0.capacity());
        }
        self.0.extend_from_slice(data);
    }

    /// NUL-terminated bytes, as the original hands to the completion
    /// callback once the child has exited.
    pub fn into_nul_terminated(mut self) -> Vec<u8> {
        self.0.push(0);
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Outcome of an async process, handed to its completion callback.
#[derive(Debug)]
pub struct Completion {
    pub exit_status: std::process::ExitStatus,
    pub stdout: Option<StdoutBuffer>,
}

type CompletionCallback = Box<dyn FnOnce(Completion)>;

struct AsyncEntry {
    child: std::process::Child,
    stdout_fd: Option<OwnedFd>,
    stdout: StdoutBuffer,
    on_complete: Option<CompletionCallback>,
}

/// Shared, `Rc<RefCell<_>>`-held supervisor state. The whole discovery
/// engine is single-threaded, so this never needs a `Mutex`.
struct Inner {
    async_list: HashMap<i32, AsyncEntry>,
}

/// Registers a SIGCHLD self-pipe waiter and keeps async children alive
/// until they are reaped.
#[derive(Clone)]
pub struct Supervisor {
    inner: Rc<RefCell<Inner>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("async_count", &self.inner.borrow().async_list.len())
            .finish()
    }
}

// The self-pipe write fd, written to from the signal handler. A raw
// `sigaction` writes a single sentinel byte and does nothing else; the
// waitset-side reader drains the pipe and re-derives which pids exited via
// `waitpid(WNOHANG)` rather than trusting the byte count, since several
// children may exit before the pipe is next drained.
static mut SIGCHLD_PIPE_WRITE: i32 = -1;

#[allow(unsafe_code)]
extern "C" fn sigchld_handler(_: i32) {
    let fd = unsafe { SIGCHLD_PIPE_WRITE };
    if fd >= 0 {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let _ = nix::unistd::write(borrowed, &[1u8]);
    }
}

impl Supervisor {
    /// Install the SIGCHLD handler and register the self-pipe reader on
    /// `waitset`. Fatal if either step fails: the daemon cannot reap async
    /// children without it.
    #[allow(unsafe_code)]
    pub fn install(waitset: &mut Waitset) -> Result<Self> {
        let (read_fd, write_fd) =
            nix::unistd::pipe().map_err(|e| Error::Fatal(format!("self-pipe: {e}")))?;
        rustix::io::fcntl_setfl(&write_fd, rustix::io::OFlags::NONBLOCK)
            .map_err(|e| Error::Fatal(format!("self-pipe nonblock: {e}")))?;
        rustix::io::fcntl_setfl(&read_fd, rustix::io::OFlags::NONBLOCK)
            .map_err(|e| Error::Fatal(format!("self-pipe nonblock: {e}")))?;

        unsafe {
            SIGCHLD_PIPE_WRITE = write_fd.as_raw_fd();
        }
        std::mem::forget(write_fd); // kept alive for the lifetime of the process

        let inner = Rc::new(RefCell::new(Inner {
            async_list: HashMap::new(),
        }));

        unsafe {
            signal::sigaction(
                Signal::SIGCHLD,
                &signal::SigAction::new(
                    SigHandler::Handler(sigchld_handler),
                    signal::SaFlags::SA_RESTART,
                    signal::SigSet::empty(),
                ),
            )
            .map_err(|e| Error::Fatal(format!("sigaction(SIGCHLD): {e}")))?;
        }

        let inner_for_cb = inner.clone();
        let drain_fd = read_fd
            .try_clone()
            .map_err(|e| Error::Fatal(format!("self-pipe clone: {e}")))?;
        waitset.register_io(read_fd, PollFlags::IN, move |_revents| {
            let mut buf = [0u8; 256];
            while matches!(nix::unistd::read(drain_fd.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
            reap_exited(&inner_for_cb);
            false // never deregister; lives for the process lifetime
        });

        Ok(Self { inner })
    }

    /// Spawn `cmd` asynchronously. If `keep_stdout`, the child's stdout is
    /// captured through a pipe drained by `waitset`; otherwise it inherits
    /// the daemon's own stdout (matching the original's "log stream"
    /// fallback). `on_complete` runs once the child has been reaped and its
    /// stdout (if any) fully drained.
    #[allow(unsafe_code)]
    pub fn run_async(
        &self,
        waitset: &mut Waitset,
        mut cmd: Command,
        keep_stdout: bool,
        on_complete: impl FnOnce(Completion) + 'static,
    ) -> Result<()> {
        cmd.stdin(Stdio::null());
        if keep_stdout {
            cmd.stdout(Stdio::piped());
        }
        let mut child = cmd.spawn()?;
        let pid = child.id() as i32;

        let stdout_fd = if keep_stdout {
            let stdout = child.stdout.take();
            stdout.map(|s| unsafe { OwnedFd::from_raw_fd(s.into_raw_fd_compat()) })
        } else {
            None
        };

        if let Some(fd) = stdout_fd.as_ref() {
            rustix::io::fcntl_setfl(fd, rustix::io::OFlags::NONBLOCK)
                .map_err(|e| Error::Fatal(format!("stdout nonblock: {e}")))?;
            let inner = self.inner.clone();
            let dup = fd.try_clone()?;
            waitset.register_io(dup, PollFlags::IN, move |_revents| {
                drain_stdout_once(&inner, pid)
            });
        }

        self.inner.borrow_mut().async_list.insert(
            pid,
            AsyncEntry {
                child,
                stdout_fd,
                stdout: StdoutBuffer::default(),
                on_complete: Some(Box::new(on_complete)),
            },
        );
        Ok(())
    }

    /// Send SIGTERM to an in-flight async process.
    pub fn stop_async(&self, pid: i32) -> Result<()> {
        if self.inner.borrow().async_list.contains_key(&pid) {
            signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
                .map_err(|e| Error::Fatal(format!("kill({pid}): {e}")))?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().async_list.len()
    }
}

trait IntoRawFdCompat {
    fn into_raw_fd_compat(self) -> std::os::fd::RawFd;
}
impl IntoRawFdCompat for std::process::ChildStdout {
    fn into_raw_fd_compat(self) -> std::os::fd::RawFd {
        use std::os::fd::IntoRawFd;
        self.into_raw_fd()
    }
}

#[allow(unsafe_code)]
fn drain_stdout_once(inner: &Rc<RefCell<Inner>>, pid: i32) -> bool {
    let mut inner = inner.borrow_mut();
    let Some(entry) = inner.async_list.get_mut(&pid) else {
        return true;
    };
    let Some(fd) = entry.stdout_fd.as_ref() else {
        return true;
    };
    let mut buf = [0u8; INITIAL_STDOUT_BUF];
    let mut file = unsafe {
        use std::os::fd::AsRawFd as _;
        std::fs::File::from_raw_fd(fd.as_raw_fd())
    };
    let n = file.read(&mut buf);
    std::mem::forget(file); // we don't own the fd via this temporary File
    match n {
        Ok(0) => true,
        Ok(n) => {
            entry.stdout.extend(&buf[..n]);
            false
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

#[allow(unsafe_code)]
fn reap_exited(inner: &Rc<RefCell<Inner>>) {
    let pids: Vec<i32> = inner.borrow().async_list.keys().copied().collect();
    for pid in pids {
        let status = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG));
        let exited_status = match status {
            Ok(WaitStatus::Exited(_, code)) => Some(exit_status_from_code(code)),
            Ok(WaitStatus::Signaled(..)) => Some(exit_status_from_code(-1)),
            _ => None,
        };
        let Some(exit_status) = exited_status else {
            continue;
        };
        let mut inner_mut = inner.borrow_mut();
        let Some(mut entry) = inner_mut.async_list.remove(&pid) else {
            continue;
        };
        drop(inner_mut);
        // Final drain in case SIGCHLD raced the last readable notification:
        // read until EOF or EWOULDBLOCK directly, we already own the fd.
        if let Some(fd) = entry.stdout_fd.as_ref() {
            let mut buf = [0u8; INITIAL_STDOUT_BUF];
            let mut file = unsafe { std::fs::File::from_raw_fd(fd.as_raw_fd()) };
            loop {
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => entry.stdout.extend(&buf[..n]),
                    Err(_) => break,
                }
            }
            std::mem::forget(file);
        }
        let _ = &mut entry.child; // already reaped via waitpid above
        if let Some(cb) = entry.on_complete.take() {
            cb(Completion {
                exit_status,
                stdout: entry.stdout_fd.map(|_| entry.stdout.clone()),
            });
        }
    }
}

fn exit_status_from_code(code: i32) -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_run_success() {
        Task::new("true", "true").run().unwrap();
    }

    #[test]
    fn task_run_failure_is_subprocess_failure() {
        let err = Task::new("false", "false").run().unwrap_err();
        assert!(matches!(err, Error::SubprocessFailure { .. }));
    }

    #[test]
    fn task_read_captures_stdout() {
        let out = Task::new("echo", "echo").args(["hi"]).read().unwrap();
        assert_eq!(out.trim(), "hi");
    }

    #[test]
    fn stdout_buffer_doubles_from_4kib() {
        let mut buf = StdoutBuffer::default();
        buf.extend(&vec![b'a'; 5000]);
        assert!(buf.0.capacity() >= 8192);
    }
}
