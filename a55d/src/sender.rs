//! Command sender
//!
//! Every outbound frame goes through [`CommandSender`]. When an
//! acknowledgment is wanted the waiter is registered before the frame is
//! written, so an `OK` that races ahead of the caller is still matched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use a55lib::{encode_frame, FramePrefix, LinkError, LinkResult};
use log::{debug, warn};

use crate::channel::ChannelWriter;
use crate::correlator::Correlator;

/// Result of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written and acknowledged
    Acked,
    /// Written; no acknowledgment was requested
    Sent,
    /// Written but no acknowledgment arrived in time
    TimedOut,
}

/// Anything that can push a command towards the co-processor
pub trait CommandSink: Send + Sync {
    fn send(
        &self,
        command: &str,
        prefix: FramePrefix,
        timeout: Duration,
        wait_for_ack: bool,
    ) -> LinkResult<SendOutcome>;
}

/// Serializes frames onto the command channel
pub struct CommandSender {
    writer: ChannelWriter,
    correlator: Arc<Correlator>,
    closed: AtomicBool,
}

impl CommandSender {
    pub fn new(writer: ChannelWriter, correlator: Arc<Correlator>) -> Self {
        Self {
            writer,
            correlator,
            closed: AtomicBool::new(false),
        }
    }

    /// Emit a `-` response frame
    pub fn send_response(&self, body: &str) -> LinkResult<()> {
        self.send(body, FramePrefix::Response, Duration::ZERO, false)
            .map(|_| ())
    }

    /// Refuse further sends
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// False once the channel has seen an unrecoverable write error
    pub fn is_healthy(&self) -> bool {
        !self.writer.has_failed()
    }
}

impl CommandSink for CommandSender {
    fn send(
        &self,
        command: &str,
        prefix: FramePrefix,
        timeout: Duration,
        wait_for_ack: bool,
    ) -> LinkResult<SendOutcome> {
        if self.is_closed() {
            return Err(LinkError::Shutdown);
        }

        let frame = encode_frame(prefix, command);
        let waiter = wait_for_ack.then(|| self.correlator.register_waiter());

        // On error the waiter is dropped here and the correlator skips it
        self.writer.write_frame(&frame)?;
        debug!("Sent {}{}", prefix.to_char(), command);

        match waiter {
            None => Ok(SendOutcome::Sent),
            Some(waiter) => match waiter.wait(timeout) {
                Some(token) if token.is_ok() => Ok(SendOutcome::Acked),
                Some(token) => Err(LinkError::protocol(format!("unexpected acknowledgment {:?}", token.0))),
                None => {
                    self.correlator.expire(waiter);
                    warn!("No acknowledgment for {}{} within {:?}", prefix.to_char(), command, timeout);
                    Ok(SendOutcome::TimedOut)
                }
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::split;
    use crate::channel::tests::channel_pair;
    use a55lib::AckToken;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use std::thread;

    /// Records sends and answers from a scripted list of outcomes
    pub(crate) struct MockSink {
        pub sent: Mutex<Vec<(String, FramePrefix, bool)>>,
        script: Mutex<Vec<LinkResult<SendOutcome>>>,
        fallback: SendOutcome,
    }

    impl MockSink {
        pub(crate) fn new(fallback: SendOutcome) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                script: Mutex::new(Vec::new()),
                fallback,
            }
        }

        pub(crate) fn scripted(outcomes: Vec<LinkResult<SendOutcome>>, fallback: SendOutcome) -> Self {
            let mut outcomes = outcomes;
            outcomes.reverse();
            Self {
                sent: Mutex::new(Vec::new()),
                script: Mutex::new(outcomes),
                fallback,
            }
        }

        pub(crate) fn sent_commands(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(c, _, _)| c.clone()).collect()
        }
    }

    impl CommandSink for MockSink {
        fn send(&self, command: &str, prefix: FramePrefix, _timeout: Duration, wait_for_ack: bool) -> LinkResult<SendOutcome> {
            self.sent.lock().unwrap().push((command.to_string(), prefix, wait_for_ack));
            self.script.lock().unwrap().pop().unwrap_or(Ok(self.fallback))
        }
    }

    fn sender_pair() -> (CommandSender, Arc<Correlator>, UnixStream) {
        let (_reader, writer, peer) = channel_pair();
        let correlator = Arc::new(Correlator::new());
        (CommandSender::new(writer, Arc::clone(&correlator)), correlator, peer)
    }

    fn read_frame(peer: &mut UnixStream) -> String {
        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_send_without_ack() {
        let (sender, correlator, mut peer) = sender_pair();
        let outcome = sender.send("hello", FramePrefix::File, Duration::ZERO, false).unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(read_frame(&mut peer), "$hello\r");
        assert_eq!(correlator.pending_waiters(), 0);
    }

    #[test]
    fn test_send_response_frame() {
        let (sender, _correlator, mut peer) = sender_pair();
        sender.send_response("a55_pong").unwrap();
        assert_eq!(read_frame(&mut peer), "-a55_pong\r");
    }

    #[test]
    fn test_acknowledged_send() {
        let (sender, correlator, mut peer) = sender_pair();

        let acker = thread::spawn(move || {
            let frame = read_frame(&mut peer);
            correlator.resolve(AckToken::ok());
            frame
        });

        let outcome = sender.send("ping", FramePrefix::Request, Duration::from_secs(5), true).unwrap();
        assert_eq!(outcome, SendOutcome::Acked);
        assert_eq!(acker.join().unwrap(), "#ping\r");
    }

    #[test]
    fn test_early_ack_matched() {
        let (sender, correlator, _peer) = sender_pair();
        correlator.resolve(AckToken::ok());

        let outcome = sender.send("ping", FramePrefix::Request, Duration::from_millis(10), true).unwrap();
        assert_eq!(outcome, SendOutcome::Acked);
        assert_eq!(correlator.pending_early(), 0);
    }

    #[test]
    fn test_timeout_then_late_ack_not_misdelivered() {
        let (sender, correlator, mut peer) = sender_pair();

        let outcome = sender.send("ping", FramePrefix::Request, Duration::from_millis(20), true).unwrap();
        assert_eq!(outcome, SendOutcome::TimedOut);
        assert_eq!(read_frame(&mut peer), "#ping\r");

        // The expired waiter is skipped; the late OK is held instead
        correlator.resolve(AckToken::ok());
        assert_eq!(correlator.pending_waiters(), 0);
        assert_eq!(correlator.pending_early(), 1);
    }

    #[test]
    fn test_closed_sender_refuses() {
        let (sender, _correlator, _peer) = sender_pair();
        sender.close();
        assert!(matches!(
            sender.send("ping", FramePrefix::Request, Duration::ZERO, false),
            Err(LinkError::Shutdown)
        ));
    }

    #[test]
    fn test_write_failure_marks_unhealthy() {
        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        drop(peer);
        let (_reader, writer) = split(std::fs::File::from(std::os::fd::OwnedFd::from(ours)));
        let correlator = Arc::new(Correlator::new());
        let sender = CommandSender::new(writer, Arc::clone(&correlator));

        assert!(sender.send("ping", FramePrefix::Request, Duration::from_millis(10), true).is_err());
        assert!(!sender.is_healthy());

        // The abandoned waiter does not swallow a later acknowledgment
        correlator.resolve(AckToken::ok());
        assert_eq!(correlator.pending_early(), 1);
    }

    #[test]
    fn test_concurrent_senders_do_not_interleave() {
        let (sender, _correlator, mut peer) = sender_pair();
        let sender = Arc::new(sender);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sender = Arc::clone(&sender);
                thread::spawn(move || {
                    for j in 0..10 {
                        sender
                            .send(&format!("event_{}_{}", i, j), FramePrefix::Request, Duration::ZERO, false)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        drop(sender);

        let mut all = Vec::new();
        peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 1024];
        while let Ok(n) = peer.read(&mut buf) {
            if n == 0 {
                break;
            }
            all.extend_from_slice(&buf[..n]);
        }

        let text = String::from_utf8(all).unwrap();
        let frames: Vec<&str> = text.split('\r').filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 40);
        assert!(frames.iter().all(|f| f.starts_with("#event_")));
    }
}
