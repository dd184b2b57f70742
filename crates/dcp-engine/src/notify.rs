//! Process-wide terminal-transition notification channel (§9): posted to
//! whenever `CommitUpdates` drives a JobRun to a terminal status, consumed
//! by the log-export driver to force an immediate flush regardless of its
//! usual thresholds. Buffered and non-blocking: a slow or absent consumer
//! never backs up a commit.

use dcp_types::JobRunId;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 1_024;

pub fn channel() -> (TerminalNotifier, TerminalNotifications) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (TerminalNotifier { tx }, TerminalNotifications { rx })
}

#[derive(Clone)]
pub struct TerminalNotifier {
    tx: mpsc::Sender<JobRunId>,
}

impl TerminalNotifier {
    /// Best-effort post: a full channel (an unresponsive or absent
    /// log-export driver) drops the notification rather than blocking the
    /// commit path that produced it.
    pub fn notify(&self, job_run_id: JobRunId) {
        if let Err(err) = self.tx.try_send(job_run_id) {
            tracing::debug!(%err, "terminal-transition notification dropped");
        }
    }
}

pub struct TerminalNotifications {
    rx: mpsc::Receiver<JobRunId>,
}

impl TerminalNotifications {
    /// Drains every notification currently buffered without blocking, used
    /// by the log-export driver's tick loop to check for a forced flush.
    pub fn drain(&mut self) -> Vec<JobRunId> {
        let mut out = Vec::new();
        while let Ok(job_run_id) = self.rx.try_recv() {
            out.push(job_run_id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_id() -> JobRunId {
        JobRunId::new("p", "c", "r")
    }

    #[test]
    fn notify_then_drain_returns_it() {
        let (tx, mut rx) = channel();
        tx.notify(run_id());
        assert_eq!(rx.drain(), vec![run_id()]);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn notify_past_capacity_drops_rather_than_blocks() {
        let (tx, mut rx) = channel();
        for _ in 0..(CHANNEL_CAPACITY + 10) {
            tx.notify(run_id());
        }
        assert!(rx.drain().len() <= CHANNEL_CAPACITY);
    }
}
