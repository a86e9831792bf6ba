use std::sync::Arc;
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::aggregate::Summary;

/// Receiver of everything the operator sees.
///
/// Slots are 0-based. Implementations are called from a single drain task,
/// one event at a time.
pub trait StatusSink: Send + Sync {
    /// Append a status line, or replace the previous one when `replace` is set
    fn post(&self, message: &str, replace: bool);
    fn set_slot_progress(&self, slot: usize, percent: f64, label: &str);
    fn set_overall_progress(&self, percent: f64, label: &str);
    fn finished(&self, summary: &Summary);
}

#[derive(Debug, Clone)]
pub enum StatusEvent {
    Message { text: String, replace: bool },
    SlotProgress { slot: usize, percent: f64, label: String },
    Overall { percent: f64, label: String },
    Finished(Summary),
    Close,
}

/// Cloneable producer side of the status channel
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: StatusEvent) {
        // The drain task is gone once the batch is torn down
        let _ = self.tx.send(event);
    }

    pub fn post(&self, text: impl Into<String>, replace: bool) {
        self.send(StatusEvent::Message { text: text.into(), replace });
    }

    pub fn slot_progress(&self, slot: usize, percent: f64, label: impl Into<String>) {
        self.send(StatusEvent::SlotProgress { slot, percent, label: label.into() });
    }

    pub fn overall(&self, percent: f64, label: impl Into<String>) {
        self.send(StatusEvent::Overall { percent, label: label.into() });
    }

    pub fn finished(&self, summary: Summary) {
        self.send(StatusEvent::Finished(summary));
    }

    pub fn close(&self) {
        self.send(StatusEvent::Close);
    }
}

/// Forward events to `sink` until `Close` arrives or every sender is dropped
pub fn spawn_drain(
    mut rx: mpsc::UnboundedReceiver<StatusEvent>,
    sink: Arc<dyn StatusSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                StatusEvent::Message { text, replace } => sink.post(&text, replace),
                StatusEvent::SlotProgress { slot, percent, label } => {
                    sink.set_slot_progress(slot, percent, &label)
                }
                StatusEvent::Overall { percent, label } => sink.set_overall_progress(percent, &label),
                StatusEvent::Finished(summary) => sink.finished(&summary),
                StatusEvent::Close => break,
            }
        }
        debug!("Status drain stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl StatusSink for Lines {
        fn post(&self, message: &str, replace: bool) {
            self.0.lock().unwrap().push(format!("{}:{}", replace, message));
        }
        fn set_slot_progress(&self, slot: usize, percent: f64, _label: &str) {
            self.0.lock().unwrap().push(format!("slot{}={}", slot, percent));
        }
        fn set_overall_progress(&self, percent: f64, label: &str) {
            self.0.lock().unwrap().push(format!("overall={} {}", percent, label));
        }
        fn finished(&self, summary: &Summary) {
            self.0.lock().unwrap().push(format!("finished {}", summary.total));
        }
    }

    #[tokio::test]
    async fn test_drain_preserves_order_and_stops_on_close() {
        let sink = Arc::new(Lines::default());
        let (tx, rx) = StatusSender::channel();
        let handle = spawn_drain(rx, sink.clone());

        tx.post("a", false);
        tx.slot_progress(1, 50.0, "x");
        tx.overall(10.0, "10% 0/3");
        tx.post("b", true);
        tx.close();
        tx.post("after close", false);
        handle.await.unwrap();

        let lines = sink.0.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec!["false:a", "slot1=50", "overall=10 10% 0/3", "true:b"]
        );
    }

    #[tokio::test]
    async fn test_drain_stops_when_senders_drop() {
        let sink = Arc::new(Lines::default());
        let (tx, rx) = StatusSender::channel();
        let handle = spawn_drain(rx, sink.clone());
        tx.post("only", false);
        drop(tx);
        handle.await.unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }
}
