use std::io;
use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;

/// How a transcoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub success: bool,
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self { code: status.code(), success: status.success() }
    }
}

/// Lifecycle control over one running transcoder.
///
/// Every method is a cheap non-blocking call. Signalling a process that has
/// already exited fails with `ErrorKind::NotFound`; platforms without job
/// control report `ErrorKind::Unsupported` for suspend and resume.
pub trait ProcessController: Send + Sync {
    fn pid(&self) -> Option<u32>;
    fn suspend(&self) -> io::Result<()>;
    fn resume(&self) -> io::Result<()>;
    fn terminate(&self) -> io::Result<()>;
    /// Reap the process if it has exited
    fn try_exit(&self) -> io::Result<Option<ExitOutcome>>;
}

fn exited() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "process has already exited")
}

struct ChildState {
    child: Child,
    exit: Option<ExitOutcome>,
}

impl ChildState {
    fn poll_exit(&mut self) -> io::Result<Option<ExitOutcome>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?.map(ExitOutcome::from);
        }
        Ok(self.exit)
    }
}

/// `ProcessController` over a spawned tokio child.
///
/// The child stays locked while it is signalled so it cannot be reaped (and
/// its pid recycled) in between.
pub struct ChildProcess {
    pid: Option<u32>,
    state: Mutex<ChildState>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            state: Mutex::new(ChildState { child, exit: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChildState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(unix)]
    fn signal(&self, sig: libc::c_int) -> io::Result<()> {
        let mut state = self.lock();
        if state.poll_exit()?.is_some() {
            return Err(exited());
        }
        let pid = self.pid.ok_or_else(exited)?;
        // SAFETY: kill(2) has no memory-safety preconditions; the child is
        // unreaped while the lock is held so the pid still names it.
        let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Err(exited());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl ProcessController for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn suspend(&self) -> io::Result<()> {
        self.signal(libc::SIGSTOP)
    }

    #[cfg(not(unix))]
    fn suspend(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "suspend is not supported on this platform"))
    }

    #[cfg(unix)]
    fn resume(&self) -> io::Result<()> {
        self.signal(libc::SIGCONT)
    }

    #[cfg(not(unix))]
    fn resume(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "resume is not supported on this platform"))
    }

    fn terminate(&self) -> io::Result<()> {
        let mut state = self.lock();
        if state.poll_exit()?.is_some() {
            return Err(exited());
        }
        // A stopped process still dies on SIGKILL
        state.child.start_kill()
    }

    fn try_exit(&self) -> io::Result<Option<ExitOutcome>> {
        self.lock().poll_exit()
    }
}

/// Poll `controller` until it exits or `limit` elapses
pub async fn wait_for_exit(
    controller: &dyn ProcessController,
    limit: Duration,
    poll: Duration,
) -> Option<ExitOutcome> {
    let deadline = Instant::now() + limit;
    loop {
        match controller.try_exit() {
            Ok(Some(outcome)) => return Some(outcome),
            Ok(None) => {}
            Err(_) => return None,
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn(program: &str, args: &[&str]) -> ChildProcess {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        ChildProcess::new(child)
    }

    #[tokio::test]
    async fn test_suspend_resume_terminate() {
        let proc = spawn("sleep", &["30"]);
        assert!(proc.pid().is_some());
        proc.suspend().unwrap();
        proc.resume().unwrap();
        proc.suspend().unwrap();
        proc.terminate().unwrap();

        let outcome = wait_for_exit(&proc, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .expect("killed process should exit");
        assert!(!outcome.success);
        assert_eq!(outcome.code, None);
    }

    #[tokio::test]
    async fn test_signals_after_exit_report_not_found() {
        let proc = spawn("true", &[]);
        let outcome = wait_for_exit(&proc, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(outcome.success);

        assert_eq!(proc.suspend().unwrap_err().kind(), io::ErrorKind::NotFound);
        assert_eq!(proc.terminate().unwrap_err().kind(), io::ErrorKind::NotFound);
        assert_eq!(proc.try_exit().unwrap(), Some(outcome));
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let proc = spawn("sleep", &["30"]);
        let started = std::time::Instant::now();
        let outcome = wait_for_exit(&proc, Duration::from_millis(50), Duration::from_millis(10)).await;
        assert!(outcome.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        proc.terminate().unwrap();
    }
}
