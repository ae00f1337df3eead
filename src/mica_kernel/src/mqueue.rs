//! Message queues.
//!
//! An [`MQueue`] holds either pending messages or pending receivers, never
//! both: a message arriving while a receiver is blocked is handed to it
//! directly and never touches the FIFO, and a receiver only blocks when no
//! message is queued. The [`QueueState`] sum type makes that invariant
//! structural rather than something the algorithms have to re-establish.
use std::collections::VecDeque;
use std::sync::Arc;

use crate::klock::{Rank, RankedMutex};
use crate::message::Message;
use crate::port::Port;
use crate::wait::{RcvReason, RcvWaiter, RcvWake};

enum QueueState {
    Empty,
    /// At least one message is pending and no receiver is blocked.
    Messages(VecDeque<Message>),
    /// At least one receiver is blocked and no message is pending.
    Receivers(VecDeque<Arc<RcvWaiter>>),
}

impl QueueState {
    /// Collapse an emptied collection back to `Empty`.
    fn normalize(&mut self) {
        let empty = match self {
            Self::Empty => false,
            Self::Messages(q) => q.is_empty(),
            Self::Receivers(q) => q.is_empty(),
        };
        if empty {
            *self = Self::Empty;
        }
    }
}

/// Outcome of [`MQueue::receive_or_enqueue`].
pub(crate) enum RcvPoll {
    /// A queued message was dequeued.
    Got(Message),
    /// The frontmost message doesn't fit the caller's buffer; it stays
    /// queued. The payload is the required size.
    TooLarge(u32),
    /// Nothing was queued; the waiter has been appended to the receiver
    /// FIFO and must now sleep on its slot.
    Waiting,
}

pub(crate) struct MQueue {
    state: RankedMutex<QueueState>,
}

impl MQueue {
    pub fn new() -> Self {
        Self {
            state: RankedMutex::new(Rank::MQueue, QueueState::Empty),
        }
    }

    /// Hand `msg` directly to a blocked receiver, or append it to the
    /// message FIFO.
    ///
    /// Receivers whose recorded buffer is too small are woken with the
    /// required size and skipped; abandoned waiters are discarded. The
    /// message's sequence number must already be stamped.
    pub fn post(&self, mut msg: Message) {
        let mut state = self.state.lock();
        if let QueueState::Receivers(waiters) = &mut *state {
            while let Some(waiter) = waiters.pop_front() {
                if msg.size() > waiter.max_size {
                    // Wake it so it can report too-large; keep looking for
                    // a receiver that can take the message.
                    let _ = waiter.slot.post(RcvWake::TooLarge(msg.size()));
                    continue;
                }
                match waiter.slot.post(RcvWake::Received(msg)) {
                    Ok(()) => {
                        log::trace!("direct handoff of a queued message");
                        state.normalize();
                        return;
                    }
                    // The waiter abandoned the wait; take the message back.
                    Err(RcvWake::Received(back)) => msg = back,
                    Err(_) => unreachable!(),
                }
            }
        }
        match &mut *state {
            QueueState::Messages(queue) => queue.push_back(msg),
            state_ref => *state_ref = QueueState::Messages(VecDeque::from([msg])),
        }
    }

    /// Dequeue a message that fits in `waiter.max_size`, or register
    /// `waiter` on the receiver FIFO.
    pub fn receive_or_enqueue(&self, waiter: &Arc<RcvWaiter>) -> RcvPoll {
        let mut state = self.state.lock();
        match &mut *state {
            QueueState::Messages(queue) => {
                // Non-empty by the state invariant.
                let size = queue
                    .front()
                    .map(Message::size)
                    .unwrap_or_default();
                if size > waiter.max_size {
                    return RcvPoll::TooLarge(size);
                }
                let msg = match queue.pop_front() {
                    Some(msg) => msg,
                    None => unreachable!(),
                };
                state.normalize();
                RcvPoll::Got(msg)
            }
            QueueState::Receivers(waiters) => {
                waiters.push_back(Arc::clone(waiter));
                RcvPoll::Waiting
            }
            state_ref => {
                *state_ref = QueueState::Receivers(VecDeque::from([Arc::clone(waiter)]));
                RcvPoll::Waiting
            }
        }
    }

    /// Remove a timed-out or interrupted waiter from the receiver FIFO.
    /// A no-op if a waker already dequeued it.
    pub fn cancel_receiver(&self, waiter: &Arc<RcvWaiter>) {
        let mut state = self.state.lock();
        if let QueueState::Receivers(waiters) = &mut *state {
            waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        }
        state.normalize();
    }

    /// Wake every blocked receiver with `reason`.
    pub fn wake_all_receivers(&self, reason: RcvReason) {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                QueueState::Receivers(waiters) => {
                    let taken = std::mem::take(waiters);
                    *state = QueueState::Empty;
                    taken
                }
                _ => return,
            }
        };
        log::trace!("waking {} receiver(s): {:?}", waiters.len(), reason);
        for waiter in waiters {
            let _ = waiter.slot.post(RcvWake::from(reason));
        }
    }

    /// Remove and return the messages destined for `port`, preserving
    /// order.
    pub fn extract_for_port(&self, port: &Arc<Port>) -> Vec<Message> {
        let mut state = self.state.lock();
        let mut taken = Vec::new();
        if let QueueState::Messages(queue) = &mut *state {
            let mut kept = VecDeque::with_capacity(queue.len());
            for msg in queue.drain(..) {
                if Arc::ptr_eq(&msg.dest, port) {
                    taken.push(msg);
                } else {
                    kept.push_back(msg);
                }
            }
            *queue = kept;
        }
        state.normalize();
        taken
    }

    /// Remove and return every queued message.
    pub fn extract_all(&self) -> Vec<Message> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, QueueState::Empty) {
            QueueState::Messages(queue) => queue.into(),
            other => {
                *state = other;
                Vec::new()
            }
        }
    }

    /// Transfer the messages destined for `port` into `dst`, in order,
    /// applying the same handoff-or-enqueue decision as a fresh delivery.
    ///
    /// The two queue locks are taken one after the other, never nested.
    pub fn move_to(&self, dst: &MQueue, port: &Arc<Port>) {
        let moved = self.extract_for_port(port);
        if moved.is_empty() {
            return;
        }
        log::trace!("moving {} message(s) between queues", moved.len());
        for msg in moved {
            dst.post(msg);
        }
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        match &*self.state.lock() {
            QueueState::Messages(q) => q.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Disposition, MsgBits, MsgHeader};
    use crate::port::Port;

    fn msg_to(port: &Arc<Port>, id: u32, len: usize) -> Message {
        Message::new(
            Arc::clone(port),
            Disposition::Send,
            MsgHeader {
                bits: MsgBits::empty(),
                id,
            },
            vec![0; len],
        )
    }

    #[test]
    fn fifo_order() {
        let port = Port::new(16);
        let queue = MQueue::new();
        for id in 0..4 {
            queue.post(msg_to(&port, id, 8));
        }
        for id in 0..4 {
            let waiter = Arc::new(RcvWaiter::new(64));
            match queue.receive_or_enqueue(&waiter) {
                RcvPoll::Got(msg) => assert_eq!(msg.header.id, id),
                _ => panic!("expected a queued message"),
            }
        }
    }

    #[test]
    fn handoff_never_queues() {
        let port = Port::new(16);
        let queue = MQueue::new();
        let waiter = Arc::new(RcvWaiter::new(64));
        assert!(matches!(
            queue.receive_or_enqueue(&waiter),
            RcvPoll::Waiting
        ));
        queue.post(msg_to(&port, 1, 8));
        assert_eq!(queue.queued_len(), 0);
        match waiter.slot.wait_deadline(None) {
            Some(RcvWake::Received(msg)) => assert_eq!(msg.header.id, 1),
            _ => panic!("expected a direct handoff"),
        }
    }

    #[test]
    fn too_large_leaves_message_queued() {
        let port = Port::new(16);
        let queue = MQueue::new();
        queue.post(msg_to(&port, 1, 128));
        let small = Arc::new(RcvWaiter::new(64));
        match queue.receive_or_enqueue(&small) {
            RcvPoll::TooLarge(size) => assert_eq!(size, 128),
            _ => panic!("expected too-large"),
        }
        assert_eq!(queue.queued_len(), 1);
        let big = Arc::new(RcvWaiter::new(256));
        assert!(matches!(queue.receive_or_enqueue(&big), RcvPoll::Got(_)));
    }

    #[test]
    fn too_small_waiter_skipped_on_handoff() {
        let port = Port::new(16);
        let queue = MQueue::new();
        let small = Arc::new(RcvWaiter::new(64));
        let big = Arc::new(RcvWaiter::new(256));
        assert!(matches!(queue.receive_or_enqueue(&small), RcvPoll::Waiting));
        assert!(matches!(queue.receive_or_enqueue(&big), RcvPoll::Waiting));
        queue.post(msg_to(&port, 1, 128));
        assert!(matches!(
            small.slot.wait_deadline(None),
            Some(RcvWake::TooLarge(128))
        ));
        assert!(matches!(
            big.slot.wait_deadline(None),
            Some(RcvWake::Received(_))
        ));
    }

    #[test]
    fn extract_for_port_is_selective() {
        let a = Port::new(16);
        let b = Port::new(16);
        let queue = MQueue::new();
        queue.post(msg_to(&a, 1, 8));
        queue.post(msg_to(&b, 2, 8));
        queue.post(msg_to(&a, 3, 8));
        let taken = queue.extract_for_port(&a);
        assert_eq!(
            taken.iter().map(|m| m.header.id).collect::<Vec<_>>(),
            [1, 3]
        );
        assert_eq!(queue.queued_len(), 1);
    }
}
