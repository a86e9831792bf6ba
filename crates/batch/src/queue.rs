use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use crate::job::Job;

/// Queue entry. `Stop` tells exactly one worker to exit.
#[derive(Debug)]
pub enum QueueItem {
    Job(Job),
    Stop,
}

/// Result of a bounded pop
#[derive(Debug)]
pub enum Popped {
    Job(Job),
    Stop,
    /// Nothing arrived within the timeout
    Empty,
    /// Closed and fully drained
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<QueueItem>,
    closed: bool,
}

/// FIFO shared by the pool workers
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns false once the queue is closed
    pub fn push(&self, job: Job) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            inner.items.push_back(QueueItem::Job(job));
        }
        self.notify.notify_one();
        true
    }

    /// Stop markers bypass `closed` so shutdown can always reach the workers
    pub fn push_stop(&self) {
        self.lock().items.push_back(QueueItem::Stop);
        self.notify.notify_one();
    }

    /// No further jobs are accepted; poppers see `Closed` once the backlog is gone
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Remove every pending job, keeping any queued stop markers
    pub fn drain(&self) -> Vec<Job> {
        let mut inner = self.lock();
        let mut jobs = Vec::new();
        let mut kept = VecDeque::new();
        for item in inner.items.drain(..) {
            match item {
                QueueItem::Job(job) => jobs.push(job),
                QueueItem::Stop => kept.push_back(QueueItem::Stop),
            }
        }
        inner.items = kept;
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock()
            .items
            .iter()
            .filter(|item| matches!(item, QueueItem::Job(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Option<Popped> {
        let mut inner = self.lock();
        match inner.items.pop_front() {
            Some(QueueItem::Job(job)) => Some(Popped::Job(job)),
            Some(QueueItem::Stop) => Some(Popped::Stop),
            None if inner.closed => Some(Popped::Closed),
            None => None,
        }
    }

    /// Wait up to `wait` for an item
    pub async fn pop(&self, wait: Duration) -> Popped {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between check and await is not lost
            notified.as_mut().enable();

            if let Some(popped) = self.try_pop() {
                return popped;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop().unwrap_or(Popped::Empty);
            }
        }
    }
}
