//! Ticket-ordered delivery lock.
//!
//! Decode tasks finish in whatever order the bodies allow, but the output
//! stream must preserve arrival order. Each task reserves a ticket when its
//! response is observed, then waits its turn before emitting:
//!
//! ```text
//! reserve() -> 0   reserve() -> 1   reserve() -> 2
//!      │                │                │
//!      ▼                ▼                ▼
//!  acquire(0)  ◀── head of line ──▶  acquire(2) blocks until 0 and 1 release
//! ```
//!
//! `release` must be called exactly once per successful `acquire`, on every
//! exit path; a task that skips it starves every later ticket.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// A ticket was used out of sequence. Always a programming defect, never an
/// expected runtime condition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("ticket {ticket} is out of sequence (head of line is {head})")]
pub struct OrderingViolation {
    /// The ticket the caller presented.
    pub ticket: u64,
    /// The ticket currently allowed to proceed.
    pub head: u64,
}

/// Result type for sequencer operations.
pub type Result<T> = std::result::Result<T, OrderingViolation>;

/// A place in the delivery order, granted by [`Sequencer::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    /// Returns the ticket's position in the reservation order.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing tickets and admits their holders to
/// the critical section in exactly that order.
#[derive(Debug, Default)]
pub struct Sequencer {
    /// Next ticket to hand out. Uniqueness only needs the atomic increment.
    reserved: AtomicU64,
    /// Ticket currently allowed to enter the critical section.
    head: Mutex<u64>,
    /// Woken on every release so waiters can re-check the head.
    advanced: Notify,
}

impl Sequencer {
    /// Creates a sequencer with the head of line at ticket 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next ticket. Never blocks; safe to call concurrently.
    pub fn reserve(&self) -> Ticket {
        Ticket(self.reserved.fetch_add(1, Ordering::Relaxed))
    }

    /// Waits until `ticket` is the head of line.
    ///
    /// Fails with [`OrderingViolation`] if the ticket's turn has already
    /// passed, which means some caller released out of protocol.
    pub async fn acquire(&self, ticket: Ticket) -> Result<()> {
        loop {
            let advanced = self.advanced.notified();
            tokio::pin!(advanced);
            // Register for the next release before re-checking the head so
            // an advance between the check and the await cannot be missed.
            advanced.as_mut().enable();
            {
                let head = self.head.lock();
                if ticket.0 == *head {
                    return Ok(());
                }
                if ticket.0 < *head {
                    return Err(OrderingViolation {
                        ticket: ticket.0,
                        head: *head,
                    });
                }
            }
            advanced.await;
        }
    }

    /// Advances the head of line past `ticket`, admitting the next holder.
    ///
    /// Legal only for the ticket currently at the head; anything else is an
    /// [`OrderingViolation`].
    pub fn release(&self, ticket: Ticket) -> Result<()> {
        {
            let mut head = self.head.lock();
            if ticket.0 != *head {
                return Err(OrderingViolation {
                    ticket: ticket.0,
                    head: *head,
                });
            }
            *head += 1;
        }
        self.advanced.notify_waiters();
        Ok(())
    }

    /// Returns the ticket currently at the head of line.
    pub fn head(&self) -> u64 {
        *self.head.lock()
    }

    /// Returns how many tickets have been handed out.
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn reserve_is_monotonic() {
        let sequencer = Sequencer::new();
        assert_eq!(sequencer.reserve().value(), 0);
        assert_eq!(sequencer.reserve().value(), 1);
        assert_eq!(sequencer.reserve().value(), 2);
        assert_eq!(sequencer.reserved(), 3);
    }

    #[tokio::test]
    async fn acquire_release_in_order() {
        let sequencer = Sequencer::new();
        let first = sequencer.reserve();
        let second = sequencer.reserve();

        sequencer.acquire(first).await.unwrap();
        sequencer.release(first).unwrap();
        sequencer.acquire(second).await.unwrap();
        sequencer.release(second).unwrap();
        assert_eq!(sequencer.head(), 2);
    }

    #[tokio::test]
    async fn release_off_turn_fails() {
        let sequencer = Sequencer::new();
        let _first = sequencer.reserve();
        let second = sequencer.reserve();

        let err = sequencer.release(second).unwrap_err();
        assert_eq!(err, OrderingViolation { ticket: 1, head: 0 });
        // The failed release must not have advanced anything.
        assert_eq!(sequencer.head(), 0);
    }

    #[tokio::test]
    async fn acquire_after_turn_passed_fails() {
        let sequencer = Sequencer::new();
        let first = sequencer.reserve();
        let _second = sequencer.reserve();

        sequencer.acquire(first).await.unwrap();
        sequencer.release(first).unwrap();

        let err = sequencer.acquire(first).await.unwrap_err();
        assert_eq!(err, OrderingViolation { ticket: 0, head: 1 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completion_order_does_not_leak_into_delivery_order() {
        let sequencer = Arc::new(Sequencer::new());
        let delivered = Arc::new(Mutex::new(Vec::new()));

        // Tickets 0, 1, 2 finish "decoding" in the order 2, 0, 1.
        let delays_ms = [20u64, 40, 0];
        let mut tasks = Vec::new();
        for delay in delays_ms {
            let ticket = sequencer.reserve();
            let sequencer = sequencer.clone();
            let delivered = delivered.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                sequencer.acquire(ticket).await.unwrap();
                delivered.lock().push(ticket.value());
                sequencer.release(ticket).unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*delivered.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn many_waiters_drain_in_reservation_order() {
        const TASKS: u64 = 32;

        let sequencer = Arc::new(Sequencer::new());
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..TASKS {
            let ticket = sequencer.reserve();
            let sequencer = sequencer.clone();
            let delivered = delivered.clone();
            // Vary finish order: later tickets mostly complete earlier.
            let delay = Duration::from_millis((TASKS - i) % 7);
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sequencer.acquire(ticket).await.unwrap();
                delivered.lock().push(ticket.value());
                sequencer.release(ticket).unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let expected: Vec<u64> = (0..TASKS).collect();
        assert_eq!(*delivered.lock(), expected);
        assert_eq!(sequencer.head(), TASKS);
    }
}
