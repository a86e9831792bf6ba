use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::Notify;
use crate::job::JobKey;
use crate::process::{wait_for_exit, ExitOutcome, ProcessController};

/// A live transcoder as seen by the control surface
#[derive(Clone)]
pub struct ProcessHandle {
    pub key: JobKey,
    pub slot: usize,
    pub controller: Arc<dyn ProcessController>,
    /// Wakes the job's progress monitor
    pub stop: Arc<Notify>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .field("pid", &self.controller.pid())
            .finish()
    }
}

/// Result of a pause/resume request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    /// No live process for that job (never started or already gone)
    NotRunning,
    Unsupported,
}

impl From<io::Result<()>> for ControlOutcome {
    fn from(result: io::Result<()>) -> Self {
        match result {
            Ok(()) => ControlOutcome::Applied,
            Err(e) if e.kind() == io::ErrorKind::Unsupported => ControlOutcome::Unsupported,
            Err(_) => ControlOutcome::NotRunning,
        }
    }
}

/// Live processes keyed by job. Each entry is removed exactly once.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<JobKey, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, ProcessHandle>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, key: JobKey, slot: usize, controller: Arc<dyn ProcessController>) -> Arc<Notify> {
        let stop = Arc::new(Notify::new());
        let handle = ProcessHandle { key, slot, controller, stop: stop.clone() };
        debug!("Job {}: registered on slot {} (pid {:?})", key, slot, handle.controller.pid());
        self.lock().insert(key, handle);
        stop
    }

    /// Remove the entry. Only the first caller gets it back.
    pub fn unregister(&self, key: JobKey) -> Option<ProcessHandle> {
        self.lock().remove(&key)
    }

    /// Run `f` against the live process under the registry lock
    pub fn with_process<T>(&self, key: JobKey, f: impl FnOnce(&ProcessHandle) -> T) -> Option<T> {
        self.lock().get(&key).map(f)
    }

    pub fn key_for_slot(&self, slot: usize) -> Option<JobKey> {
        self.lock().values().find(|h| h.slot == slot).map(|h| h.key)
    }

    pub fn keys(&self) -> Vec<JobKey> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pause(&self, key: JobKey) -> ControlOutcome {
        let outcome = self
            .with_process(key, |h| ControlOutcome::from(h.controller.suspend()))
            .unwrap_or(ControlOutcome::NotRunning);
        if outcome == ControlOutcome::Applied {
            info!("Job {}: paused", key);
        }
        outcome
    }

    pub fn resume(&self, key: JobKey) -> ControlOutcome {
        let outcome = self
            .with_process(key, |h| ControlOutcome::from(h.controller.resume()))
            .unwrap_or(ControlOutcome::NotRunning);
        if outcome == ControlOutcome::Applied {
            info!("Job {}: resumed", key);
        }
        outcome
    }

    /// Cancel a running job. Returns false if the job already finished or
    /// was cancelled by someone else; otherwise the process has been
    /// told to stop and waited for up to `wait`.
    pub async fn cancel(&self, key: JobKey, wait: Duration) -> bool {
        let Some(handle) = self.unregister(key) else {
            debug!("Job {}: cancel ignored, not running", key);
            return false;
        };
        info!("Job {}: cancelling", key);
        stop_process(&handle, wait).await;
        true
    }

    /// Remove and kill every live process. Returns how many were stopped.
    pub fn terminate_all(&self) -> usize {
        let handles: Vec<ProcessHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.stop.notify_one();
            if let Err(e) = handle.controller.terminate() {
                debug!("Job {}: terminate during shutdown: {}", handle.key, e);
            }
        }
        handles.len()
    }
}

async fn stop_process(handle: &ProcessHandle, wait: Duration) -> Option<ExitOutcome> {
    handle.stop.notify_one();
    // A suspended process cannot act on anything but SIGKILL, which terminate sends
    if let Err(e) = handle.controller.terminate() {
        debug!("Job {}: terminate: {}", handle.key, e);
    }
    let poll = (wait / 20).max(Duration::from_millis(10));
    let outcome = wait_for_exit(handle.controller.as_ref(), wait, poll).await;
    if outcome.is_none() {
        warn!("Job {}: process did not exit within {:?}", handle.key, wait);
    }
    outcome
}
