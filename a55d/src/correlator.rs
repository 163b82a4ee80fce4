//! Response correlator
//!
//! Pairs acknowledgments read by the RX dispatcher with the senders waiting
//! for them. Waiters are served oldest first. An acknowledgment that arrives
//! with no live waiter is held and handed to the next waiter registered.
//! A waiter that timed out or already received its token is skipped, so a
//! late acknowledgment is never delivered to a waiter that gave up.
//!
//! A waiter whose timeout fires must be handed back through
//! [`Correlator::expire`]. A token placed in its slot between the timeout
//! and the hand-back is passed on instead of being lost with the waiter.

use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Mutex;
use std::time::Duration;

use a55lib::AckToken;
use log::{debug, warn};

struct Slots {
    waiters: VecDeque<SyncSender<AckToken>>,
    early: VecDeque<AckToken>,
}

/// Response correlator shared by the dispatcher and all senders
pub struct Correlator {
    slots: Mutex<Slots>,
}

/// Outcome of delivering an acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a waiting sender
    Delivered,
    /// No live waiter; held for the next one
    Buffered,
}

/// A registered interest in the next acknowledgment
pub struct Waiter {
    rx: Receiver<AckToken>,
}

impl Waiter {
    /// Block until a token arrives or the timeout expires
    pub fn wait(&self, timeout: Duration) -> Option<AckToken> {
        match self.rx.recv_timeout(timeout) {
            Ok(token) => Some(token),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take a token that is already here without blocking
    pub fn try_take(&self) -> Option<AckToken> {
        self.rx.try_recv().ok()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                waiters: VecDeque::new(),
                early: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave the queues inconsistent
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a waiter for the next acknowledgment.
    ///
    /// If an early acknowledgment is held it is handed over immediately.
    pub fn register_waiter(&self) -> Waiter {
        let (tx, rx) = sync_channel(1);
        let mut slots = self.lock();

        match slots.early.pop_front() {
            Some(token) => {
                debug!("Handing held acknowledgment {:?} to new waiter", token.0);
                // Capacity is one and the slot is empty, so this cannot fail
                let _ = tx.try_send(token);
            }
            None => slots.waiters.push_back(tx),
        }

        Waiter { rx }
    }

    /// Deliver an acknowledgment to the oldest live waiter
    pub fn resolve(&self, token: AckToken) -> Delivery {
        let mut slots = self.lock();
        match Self::deliver(&mut *slots, token) {
            Ok(()) => Delivery::Delivered,
            Err(token) => {
                warn!("Acknowledgment {:?} with no waiter, holding it", token.0);
                slots.early.push_back(token);
                Delivery::Buffered
            }
        }
    }

    /// Retire a waiter that gave up.
    ///
    /// Under the lock no further token can reach it, so anything already in
    /// its slot is passed to the next live waiter or held ahead of later
    /// arrivals. Returns where such a token went.
    pub fn expire(&self, waiter: Waiter) -> Option<Delivery> {
        let mut slots = self.lock();
        let stranded = waiter.rx.try_recv().ok();
        drop(waiter);

        let token = stranded?;
        debug!("Passing on acknowledgment {:?} from an expired waiter", token.0);
        match Self::deliver(&mut *slots, token) {
            Ok(()) => Some(Delivery::Delivered),
            Err(token) => {
                slots.early.push_front(token);
                Some(Delivery::Buffered)
            }
        }
    }

    /// Hand `token` to the oldest live waiter, or give it back
    fn deliver(slots: &mut Slots, token: AckToken) -> Result<(), AckToken> {
        let mut token = token;
        while let Some(tx) = slots.waiters.pop_front() {
            match tx.try_send(token) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(t)) | Err(TrySendError::Full(t)) => token = t,
            }
        }
        Err(token)
    }

    /// Acknowledgments held for future waiters
    pub fn pending_early(&self) -> usize {
        self.lock().early.len()
    }

    /// Waiters registered and not yet served
    pub fn pending_waiters(&self) -> usize {
        self.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_waiters_served_in_order() {
        let correlator = Correlator::new();
        let first = correlator.register_waiter();
        let second = correlator.register_waiter();

        assert_eq!(correlator.resolve(AckToken::ok()), Delivery::Delivered);
        assert!(first.try_take().is_some());
        assert!(second.try_take().is_none());

        assert_eq!(correlator.resolve(AckToken("ok".to_string())), Delivery::Delivered);
        assert_eq!(second.try_take(), Some(AckToken("ok".to_string())));
    }

    #[test]
    fn test_early_ack_held_for_next_waiter() {
        let correlator = Correlator::new();
        assert_eq!(correlator.resolve(AckToken::ok()), Delivery::Buffered);
        assert_eq!(correlator.pending_early(), 1);

        let waiter = correlator.register_waiter();
        assert_eq!(correlator.pending_early(), 0);
        assert_eq!(correlator.pending_waiters(), 0);
        assert_eq!(waiter.wait(Duration::from_millis(1)), Some(AckToken::ok()));
    }

    #[test]
    fn test_timed_out_waiter_skipped() {
        let correlator = Correlator::new();
        let stale = correlator.register_waiter();
        assert_eq!(stale.wait(Duration::from_millis(5)), None);
        assert_eq!(correlator.expire(stale), None);

        let fresh = correlator.register_waiter();
        assert_eq!(correlator.resolve(AckToken::ok()), Delivery::Delivered);
        assert_eq!(fresh.try_take(), Some(AckToken::ok()));
    }

    #[test]
    fn test_late_ack_after_timeout_is_held() {
        let correlator = Correlator::new();
        let waiter = correlator.register_waiter();
        assert_eq!(waiter.wait(Duration::from_millis(5)), None);
        correlator.expire(waiter);

        assert_eq!(correlator.resolve(AckToken::ok()), Delivery::Buffered);
        assert_eq!(correlator.pending_waiters(), 0);
        assert_eq!(correlator.pending_early(), 1);
    }

    #[test]
    fn test_token_reaching_expired_waiter_is_passed_on() {
        let correlator = Correlator::new();
        let expired = correlator.register_waiter();
        let next = correlator.register_waiter();

        // Token lands in the slot of a waiter whose timeout already fired
        assert_eq!(correlator.resolve(AckToken::ok()), Delivery::Delivered);
        assert_eq!(correlator.expire(expired), Some(Delivery::Delivered));
        assert_eq!(next.try_take(), Some(AckToken::ok()));
    }

    #[test]
    fn test_token_reaching_expired_waiter_is_held() {
        let correlator = Correlator::new();
        let expired = correlator.register_waiter();
        assert_eq!(correlator.resolve(AckToken::ok()), Delivery::Delivered);
        assert_eq!(correlator.resolve(AckToken("ok".to_string())), Delivery::Buffered);

        assert_eq!(correlator.expire(expired), Some(Delivery::Buffered));
        assert_eq!(correlator.pending_early(), 2);

        // The stranded token arrived first and is handed out first
        let waiter = correlator.register_waiter();
        assert_eq!(waiter.try_take(), Some(AckToken::ok()));
    }

    #[test]
    fn test_expire_empty_waiter() {
        let correlator = Correlator::new();
        let waiter = correlator.register_waiter();
        assert_eq!(waiter.wait(Duration::from_millis(1)), None);
        assert_eq!(correlator.expire(waiter), None);
        assert_eq!(correlator.pending_early(), 0);
    }

    #[test]
    fn test_concurrent_waiters_each_get_one() {
        let correlator = Arc::new(Correlator::new());
        let waiters: Vec<Waiter> = (0..8).map(|_| correlator.register_waiter()).collect();

        let handles: Vec<_> = waiters
            .into_iter()
            .map(|w| thread::spawn(move || w.wait(Duration::from_secs(5))))
            .collect();

        let resolver = Arc::clone(&correlator);
        thread::spawn(move || {
            for _ in 0..8 {
                resolver.resolve(AckToken::ok());
            }
        })
        .join()
        .unwrap();

        let received = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(received, 8);
        assert_eq!(correlator.pending_early(), 0);
    }
}
