//! The blocking primitive.
//!
//! A [`WaitSlot`] is the rendezvous point between one blocked context and
//! whoever wakes it: the waiter sleeps on the slot with an optional
//! deadline, and a waker deposits a single wake code into it. The race
//! between a timeout and a concurrent wakeup is settled by whichever side
//! flips the slot's state first under the slot lock; the loser observes
//! the decided state and treats its own signal as a no-op. In particular,
//! [`WaitSlot::post`] hands the value back to the waker when the waiter has
//! already given up, so a message offered to a timing-out receiver is never
//! lost.
use std::mem;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::message::{Message, MsgSize};

enum SlotState<T> {
    /// The waiter is (or is about to start) sleeping.
    Waiting,
    /// A wake code was deposited before the waiter gave up.
    Posted(T),
    /// The waiter timed out or already consumed a posted code; late posts
    /// must be refused.
    Abandoned,
}

/// A one-shot slot a blocked context sleeps on.
pub(crate) struct WaitSlot<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
}

impl<T> WaitSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Waiting),
            cond: Condvar::new(),
        }
    }

    /// Deposit a wake code and wake the waiter.
    ///
    /// Returns the code back if the waiter already abandoned the wait (or
    /// was already woken), in which case it had no effect.
    pub fn post(&self, code: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        match *state {
            SlotState::Waiting => {
                *state = SlotState::Posted(code);
                self.cond.notify_one();
                Ok(())
            }
            SlotState::Posted(_) | SlotState::Abandoned => Err(code),
        }
    }

    /// Sleep until a code is posted or `deadline` passes. `None` sleeps
    /// without a time limit.
    ///
    /// Returns `None` on timeout, in which case the slot is marked
    /// abandoned before returning so that any in-flight `post` fails.
    pub fn wait_deadline(&self, deadline: Option<Instant>) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if matches!(*state, SlotState::Posted(_)) {
                match mem::replace(&mut *state, SlotState::Abandoned) {
                    SlotState::Posted(code) => return Some(code),
                    _ => unreachable!(),
                }
            }
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        *state = SlotState::Abandoned;
                        return None;
                    }
                    let (guard, _) =
                        self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }
}

/// Wake codes for a blocked receiver.
pub(crate) enum RcvWake {
    /// A message was handed off directly.
    Received(Message),
    /// A sender offered a message too big for the recorded buffer size;
    /// the payload is the required size.
    TooLarge(MsgSize),
    /// The port or port set was destroyed.
    PortDied,
    /// The port moved into a port set while the receiver was waiting on
    /// the port's own queue.
    PortChanged,
    /// The wait was interrupted.
    Interrupted,
}

/// Why a blocked receiver is woken without a message.
#[derive(Clone, Copy, Debug)]
pub(crate) enum RcvReason {
    PortDied,
    PortChanged,
    Interrupted,
}

impl From<RcvReason> for RcvWake {
    fn from(x: RcvReason) -> Self {
        match x {
            RcvReason::PortDied => Self::PortDied,
            RcvReason::PortChanged => Self::PortChanged,
            RcvReason::Interrupted => Self::Interrupted,
        }
    }
}

/// A receiver blocked on a message queue.
pub(crate) struct RcvWaiter {
    pub slot: WaitSlot<RcvWake>,
    /// Largest message the receiver's buffer can take, recorded so a
    /// sender's direct handoff can size-check without waking it.
    pub max_size: MsgSize,
}

impl RcvWaiter {
    pub fn new(max_size: MsgSize) -> Self {
        Self {
            slot: WaitSlot::new(),
            max_size,
        }
    }
}

/// Wake codes for a sender blocked on a full port.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SendWake {
    /// Queue state changed (space freed, or the port died); re-validate
    /// and retry the delivery.
    Retry,
    /// The wait was interrupted.
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn post_then_wait() {
        let slot = WaitSlot::new();
        assert!(slot.post(7u32).is_ok());
        assert_eq!(slot.wait_deadline(None), Some(7));
    }

    #[test]
    fn wait_then_post() {
        let slot = Arc::new(WaitSlot::new());
        let waker = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                slot.post(42u32)
            })
        };
        assert_eq!(slot.wait_deadline(None), Some(42));
        assert!(waker.join().unwrap().is_ok());
    }

    #[test]
    fn timeout_refuses_late_post() {
        let slot = WaitSlot::new();
        let deadline = Instant::now() + Duration::from_millis(5);
        assert_eq!(slot.wait_deadline(Some(deadline)), None);
        // The waker gets its value back untouched.
        assert_eq!(slot.post("msg"), Err("msg"));
    }

    #[test]
    fn double_post_refused() {
        let slot = WaitSlot::new();
        assert!(slot.post(1u32).is_ok());
        assert_eq!(slot.post(2u32), Err(2));
        assert_eq!(slot.wait_deadline(None), Some(1));
    }
}
