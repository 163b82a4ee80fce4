//! Retry queue
//!
//! Event-derived commands are queued here and delivered by one worker, in
//! arrival order, each with its own attempt budget. A full queue drops the
//! new entry instead of blocking the producer or evicting older work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use a55lib::{FramePrefix, LinkError, LinkResult};
use log::{debug, error, info, warn};

use crate::sender::{CommandSink, SendOutcome};
use crate::wait::sleep_while_running;

/// A queued command and its remaining attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub command: String,
    pub attempts: u32,
}

/// Producer side of the retry queue
#[derive(Clone)]
pub struct RetryQueue {
    tx: SyncSender<RetryEntry>,
}

impl RetryQueue {
    /// Create a queue holding at most `capacity` entries
    pub fn bounded(capacity: usize) -> (RetryQueue, Receiver<RetryEntry>) {
        let (tx, rx) = sync_channel(capacity);
        (RetryQueue { tx }, rx)
    }

    /// Queue a command without blocking
    pub fn enqueue(&self, command: impl Into<String>, attempts: u32) -> LinkResult<()> {
        let entry = RetryEntry {
            command: command.into(),
            attempts,
        };

        match self.tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(entry)) => {
                warn!("Retry queue full, dropping {}", entry.command);
                Err(LinkError::QueueFull(entry.command))
            }
            Err(TrySendError::Disconnected(_)) => Err(LinkError::Shutdown),
        }
    }
}

/// How one entry ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Acknowledged on the given attempt
    Delivered { attempt: u32 },
    /// Every attempt failed
    Exhausted,
    /// The daemon is stopping
    Abandoned,
}

/// Single consumer of the retry queue
pub struct RetryWorker {
    rx: Receiver<RetryEntry>,
    sink: Arc<dyn CommandSink>,
    ack_timeout: Duration,
    retry_pause: Duration,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl RetryWorker {
    pub fn new(
        rx: Receiver<RetryEntry>,
        sink: Arc<dyn CommandSink>,
        ack_timeout: Duration,
        retry_pause: Duration,
        poll_interval: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            sink,
            ack_timeout,
            retry_pause,
            poll_interval,
            running,
        }
    }

    /// Wait one poll interval for the next entry.
    /// `Err(LinkError::Shutdown)` once every producer is gone.
    pub fn next_entry(&self) -> LinkResult<Option<RetryEntry>> {
        match self.rx.recv_timeout(self.poll_interval) {
            Ok(entry) => Ok(Some(entry)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Shutdown),
        }
    }

    /// Deliver one entry, using at most its attempt budget
    pub fn process_entry(&self, entry: &RetryEntry) -> EntryOutcome {
        for attempt in 1..=entry.attempts {
            match self.sink.send(&entry.command, FramePrefix::Request, self.ack_timeout, true) {
                Ok(SendOutcome::Acked) => {
                    debug!("{} acknowledged on attempt {}", entry.command, attempt);
                    return EntryOutcome::Delivered { attempt };
                }
                Ok(outcome) => {
                    warn!("{} attempt {}/{}: {:?}", entry.command, attempt, entry.attempts, outcome);
                }
                Err(LinkError::Shutdown) => return EntryOutcome::Abandoned,
                Err(e) => {
                    warn!("{} attempt {}/{} failed: {}", entry.command, attempt, entry.attempts, e);
                }
            }

            if attempt < entry.attempts
                && !sleep_while_running(&self.running, self.retry_pause, self.retry_pause)
            {
                return EntryOutcome::Abandoned;
            }
        }

        error!("{} dropped after {} attempt(s)", entry.command, entry.attempts);
        EntryOutcome::Exhausted
    }

    /// Drain the queue until the running flag clears
    pub fn run(self) {
        info!("Retry worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.next_entry() {
                Ok(Some(entry)) => {
                    if self.process_entry(&entry) == EntryOutcome::Abandoned {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(_) => break,
            }
        }

        let left = self.rx.try_iter().count();
        if left > 0 {
            warn!("Retry worker stopping with {} undelivered entr(ies)", left);
        }
        info!("Retry worker stopped");
    }

    /// Start the worker on a named thread
    pub fn spawn(self) -> LinkResult<JoinHandle<()>> {
        Ok(thread::Builder::new()
            .name("a55-retry".to_string())
            .spawn(move || self.run())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::tests::MockSink;

    fn worker(sink: Arc<MockSink>, rx: Receiver<RetryEntry>, running: Arc<AtomicBool>) -> RetryWorker {
        let sink: Arc<dyn CommandSink> = sink;
        RetryWorker::new(
            rx,
            sink,
            Duration::from_millis(10),
            Duration::from_millis(1),
            Duration::from_millis(10),
            running,
        )
    }

    #[test]
    fn test_never_acked_uses_full_budget() {
        let sink = Arc::new(MockSink::new(SendOutcome::TimedOut));
        let (_queue, rx) = RetryQueue::bounded(4);
        let worker = worker(Arc::clone(&sink), rx, Arc::new(AtomicBool::new(true)));

        let entry = RetryEntry { command: "door open".to_string(), attempts: 3 };
        assert_eq!(worker.process_entry(&entry), EntryOutcome::Exhausted);
        assert_eq!(sink.sent_commands().len(), 3);
        assert!(sink.sent.lock().unwrap().iter().all(|(_, p, ack)| *p == FramePrefix::Request && *ack));
    }

    #[test]
    fn test_ack_stops_retrying() {
        let sink = Arc::new(MockSink::scripted(
            vec![Ok(SendOutcome::TimedOut), Err(LinkError::Timeout), Ok(SendOutcome::Acked)],
            SendOutcome::TimedOut,
        ));
        let (_queue, rx) = RetryQueue::bounded(4);
        let worker = worker(Arc::clone(&sink), rx, Arc::new(AtomicBool::new(true)));

        let entry = RetryEntry { command: "door open".to_string(), attempts: 5 };
        assert_eq!(worker.process_entry(&entry), EntryOutcome::Delivered { attempt: 3 });
        assert_eq!(sink.sent_commands().len(), 3);
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (queue, rx) = RetryQueue::bounded(2);
        queue.enqueue("a 1", 2).unwrap();
        queue.enqueue("b 2", 2).unwrap();
        assert!(matches!(queue.enqueue("c 3", 2), Err(LinkError::QueueFull(c)) if c == "c 3"));

        let kept: Vec<String> = rx.try_iter().map(|e| e.command).collect();
        assert_eq!(kept, vec!["a 1".to_string(), "b 2".to_string()]);
    }

    #[test]
    fn test_worker_processes_in_order() {
        let sink = Arc::new(MockSink::new(SendOutcome::Acked));
        let (queue, rx) = RetryQueue::bounded(8);
        let running = Arc::new(AtomicBool::new(true));
        for i in 0..5 {
            queue.enqueue(format!("event {}", i), 2).unwrap();
        }
        drop(queue);

        // All producers gone: the worker drains and exits
        worker(Arc::clone(&sink), rx, Arc::clone(&running)).spawn().unwrap().join().unwrap();

        let expected: Vec<String> = (0..5).map(|i| format!("event {}", i)).collect();
        assert_eq!(sink.sent_commands(), expected);
    }

    #[test]
    fn test_shutdown_abandons_entry() {
        let sink = Arc::new(MockSink::scripted(vec![Err(LinkError::Shutdown)], SendOutcome::Acked));
        let (_queue, rx) = RetryQueue::bounded(1);
        let worker = worker(Arc::clone(&sink), rx, Arc::new(AtomicBool::new(true)));

        let entry = RetryEntry { command: "x 1".to_string(), attempts: 3 };
        assert_eq!(worker.process_entry(&entry), EntryOutcome::Abandoned);
        assert_eq!(sink.sent_commands().len(), 1);
    }
}
