//! Ports and port sets.
//!
//! A port is a unidirectional message endpoint with exactly one receiver;
//! a port set groups ports behind one shared receive queue. Both embed an
//! [`MQueue`]. The port's own lock guards liveness, the queue limit, the
//! in-flight count, the sequence counter, and the blocked-sender list; it
//! is ordered before the queue lock so delivery can stamp a sequence
//! number and enqueue without letting another sender slip in between.
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::klock::{Rank, RankedMutex};
use crate::message::Message;
use crate::mqueue::MQueue;
use crate::wait::{RcvReason, SendWake, WaitSlot};

/// Default queue limit for a new port.
pub const DEFAULT_QLIMIT: usize = 5;

/// An in-kernel message handler. Dispatch is synchronous; a returned
/// message is the reply to send.
pub type KernelHandler = Box<dyn Fn(Message) -> Option<Message> + Send + Sync>;

struct PortInner {
    alive: bool,
    /// Messages accepted but not yet received. Includes messages parked on
    /// a port set's queue.
    in_flight: usize,
    qlimit: usize,
    seqno: u64,
    pset: Option<Arc<PortSet>>,
    blocked_senders: VecDeque<Arc<WaitSlot<SendWake>>>,
}

pub struct Port {
    inner: RankedMutex<PortInner>,
    pub(crate) mqueue: MQueue,
    /// Present on kernel-owned ports; immutable after creation.
    handler: Option<KernelHandler>,
}

/// Why [`Port::try_deliver`] refused a message.
pub(crate) enum DeliverFail {
    /// The port has been destroyed.
    Dead,
    /// The queue is at its limit and the message is not exempt.
    Full,
}

impl Port {
    pub fn new(qlimit: usize) -> Arc<Self> {
        Self::build(qlimit, None)
    }

    /// Create a kernel-owned port whose messages are dispatched to
    /// `handler` instead of being queued.
    pub fn with_handler(qlimit: usize, handler: KernelHandler) -> Arc<Self> {
        Self::build(qlimit, Some(handler))
    }

    fn build(qlimit: usize, handler: Option<KernelHandler>) -> Arc<Self> {
        Arc::new(Self {
            inner: RankedMutex::new(
                Rank::Port,
                PortInner {
                    alive: true,
                    in_flight: 0,
                    qlimit,
                    seqno: 0,
                    pset: None,
                    blocked_senders: VecDeque::new(),
                },
            ),
            mqueue: MQueue::new(),
            handler,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().alive
    }

    /// `true` if messages to this port are consumed by an in-kernel
    /// handler.
    pub fn is_kernel(&self) -> bool {
        self.handler.is_some()
    }

    /// `true` while the port is a member of a port set. Its messages are
    /// then on the set's shared queue, so receiving must go through the
    /// set.
    pub fn in_set(&self) -> bool {
        self.inner.lock().pset.is_some()
    }

    /// Raise or lower the queue limit, releasing senders a raised limit
    /// now admits.
    pub fn set_qlimit(&self, qlimit: usize) {
        let mut inner = self.inner.lock();
        inner.qlimit = qlimit;
        // One wakeup per slot the raised limit opened; each woken sender
        // claims one on its retry.
        let mut room = inner.qlimit.saturating_sub(inner.in_flight);
        while room > 0 && wake_one_sender(&mut inner) {
            room -= 1;
        }
    }

    /// Dispatch a message to the in-kernel handler. Never blocks.
    ///
    /// Returns the handler's reply, if any. A message to a dead kernel
    /// port is destroyed.
    pub(crate) fn kernel_dispatch(&self, msg: Message) -> Option<Message> {
        debug_assert!(self.is_kernel());
        if !self.is_alive() {
            msg.destroy();
            return None;
        }
        log::trace!("kernel dispatch of message id {}", msg.header.id);
        match &self.handler {
            Some(handler) => handler(msg),
            None => None,
        }
    }

    /// Accept `msg` and enqueue it (or hand it to a blocked receiver),
    /// stamping the next sequence number.
    ///
    /// The port lock is held across the queue operation so that sequence
    /// numbers enter the queue in increasing order. Refuses the message,
    /// handing it back, when the port is dead or the queue is at its
    /// limit for a non-exempt message.
    pub(crate) fn try_deliver(
        &self,
        mut msg: Message,
        exempt_from_limit: bool,
    ) -> Result<(), (Message, DeliverFail)> {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return Err((msg, DeliverFail::Dead));
        }
        let exempt = exempt_from_limit
            || matches!(msg.disposition, crate::message::Disposition::SendOnce);
        if inner.in_flight >= inner.qlimit && !exempt {
            return Err((msg, DeliverFail::Full));
        }
        inner.in_flight += 1;
        inner.seqno += 1;
        msg.seqno = inner.seqno;
        log::trace!(
            "accepting message id {} seqno {} ({} in flight)",
            msg.header.id,
            msg.seqno,
            inner.in_flight,
        );
        match inner.pset.clone() {
            Some(set) => set.mqueue.post(msg),
            None => self.mqueue.post(msg),
        }
        Ok(())
    }

    /// Park a sender waiting for queue space. Returns `false` without
    /// parking when the state already changed (room appeared, the limit
    /// no longer applies, or the port died) and the caller should retry
    /// delivery instead.
    pub(crate) fn block_sender(&self, slot: &Arc<WaitSlot<SendWake>>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.alive || inner.in_flight < inner.qlimit {
            return false;
        }
        inner.blocked_senders.push_back(Arc::clone(slot));
        true
    }

    /// Remove a timed-out sender from the blocked list. A no-op if a wake
    /// already removed it.
    pub(crate) fn cancel_sender(&self, slot: &Arc<WaitSlot<SendWake>>) {
        let mut inner = self.inner.lock();
        inner.blocked_senders.retain(|s| !Arc::ptr_eq(s, slot));
    }

    /// Release one in-flight slot after a successful receive, waking at
    /// most one blocked sender if the limit is no longer exceeded.
    ///
    /// A receiver can finish a dequeue after the port was destroyed;
    /// destruction already reset the accounting, so that release is a
    /// no-op, not an underflow.
    pub(crate) fn release_one(&self) {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return;
        }
        assert_ne!(inner.in_flight, 0, "in-flight count underflow");
        inner.in_flight -= 1;
        if inner.in_flight < inner.qlimit {
            wake_one_sender(&mut inner);
        }
    }

    /// Destroy the port: mark it dead, leave its port set, destroy every
    /// queued message, and wake every blocked receiver and sender.
    pub fn destroy(self: &Arc<Self>) {
        let (pset, senders) = {
            let mut inner = self.inner.lock();
            if !inner.alive {
                return;
            }
            inner.alive = false;
            inner.in_flight = 0;
            (inner.pset.take(), std::mem::take(&mut inner.blocked_senders))
        };
        log::debug!("destroying port {:p}", Arc::as_ptr(self));
        if let Some(set) = pset {
            set.drop_member(self);
            for msg in set.mqueue.extract_for_port(self) {
                msg.destroy();
            }
        }
        for msg in self.mqueue.extract_all() {
            msg.destroy();
        }
        self.mqueue.wake_all_receivers(RcvReason::PortDied);
        // Senders re-validate on wake and observe the death.
        for sender in senders {
            let _ = sender.post(SendWake::Retry);
        }
    }

    /// Wake every context blocked on this port with an interruption code.
    /// Task-termination hook.
    pub fn interrupt_blocked(&self) {
        let senders = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.blocked_senders)
        };
        for sender in senders {
            let _ = sender.post(SendWake::Interrupted);
        }
        self.mqueue.wake_all_receivers(RcvReason::Interrupted);
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }
}

/// Wake the frontmost blocked sender that hasn't abandoned its wait.
/// Returns `false` if none was woken. Caller holds the port lock.
fn wake_one_sender(inner: &mut PortInner) -> bool {
    while let Some(sender) = inner.blocked_senders.pop_front() {
        if sender.post(SendWake::Retry).is_ok() {
            return true;
        }
    }
    false
}

struct PortSetInner {
    alive: bool,
    /// Weak so that a port's back reference to the set doesn't form a
    /// cycle.
    members: Vec<Weak<Port>>,
}

pub struct PortSet {
    inner: RankedMutex<PortSetInner>,
    pub(crate) mqueue: MQueue,
}

impl PortSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RankedMutex::new(
                Rank::PortSet,
                PortSetInner {
                    alive: true,
                    members: Vec::new(),
                },
            ),
            mqueue: MQueue::new(),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().alive
    }

    /// Add `port` to the set. The port's pending messages move to the
    /// set's shared queue, and receivers blocked on the port's own queue
    /// are woken with a changed-membership code.
    ///
    /// Returns `false` when the set or the port is dead, or the port is
    /// already a member of a set.
    pub fn add(self: &Arc<Self>, port: &Arc<Port>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return false;
        }
        let mut port_inner = port.inner.lock();
        if !port_inner.alive || port_inner.pset.is_some() {
            return false;
        }
        port_inner.pset = Some(Arc::clone(self));
        inner.members.push(Arc::downgrade(port));
        log::debug!("port {:p} joins set {:p}", Arc::as_ptr(port), Arc::as_ptr(self));
        // The port lock stays held across the transfer: a delivery slipping
        // in between the membership flip and the move would land a later
        // seqno on the set queue ahead of the older messages.
        port.mqueue.wake_all_receivers(RcvReason::PortChanged);
        port.mqueue.move_to(&self.mqueue, port);
        true
    }

    /// Remove `port` from the set, moving its pending messages back to its
    /// own queue. Returns `false` if the port wasn't a member.
    pub fn remove(self: &Arc<Self>, port: &Arc<Port>) -> bool {
        let mut inner = self.inner.lock();
        let mut found = false;
        inner.members.retain(|m| match m.upgrade() {
            Some(p) if Arc::ptr_eq(&p, port) => {
                found = true;
                false
            }
            Some(_) => true,
            // Opportunistically drop members that went away.
            None => false,
        });
        if !found {
            return false;
        }
        let mut port_inner = port.inner.lock();
        port_inner.pset = None;
        // Lock held across the move; see `add`.
        self.mqueue.move_to(&port.mqueue, port);
        true
    }

    /// Detach a member during [`Port::destroy`]. The caller extracts the
    /// port's messages itself; the port's back reference is already gone.
    fn drop_member(&self, port: &Arc<Port>) {
        let mut inner = self.inner.lock();
        inner
            .members
            .retain(|m| m.upgrade().map_or(false, |p| !Arc::ptr_eq(&p, port)));
    }

    /// Destroy the set: detach every member, return their pending messages
    /// to the members' own queues, and wake the set's blocked receivers.
    pub fn destroy(self: &Arc<Self>) {
        let members = {
            let mut inner = self.inner.lock();
            if !inner.alive {
                return;
            }
            inner.alive = false;
            std::mem::take(&mut inner.members)
        };
        log::debug!("destroying port set {:p}", Arc::as_ptr(self));
        for member in members.iter().filter_map(Weak::upgrade) {
            let mut member_inner = member.inner.lock();
            member_inner.pset = None;
            // Lock held across the move; see `add`.
            self.mqueue.move_to(&member.mqueue, &member);
        }
        self.mqueue.wake_all_receivers(RcvReason::PortDied);
    }

    /// Wake every receiver blocked on the set's queue with an interruption
    /// code. Task-termination hook.
    pub fn interrupt_blocked(&self) {
        self.mqueue.wake_all_receivers(RcvReason::Interrupted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Disposition, MsgBits, MsgHeader};
    use crate::mqueue::RcvPoll;
    use crate::wait::RcvWaiter;

    fn msg_to(port: &Arc<Port>, id: u32) -> Message {
        Message::new(
            Arc::clone(port),
            Disposition::Send,
            MsgHeader {
                bits: MsgBits::empty(),
                id,
            },
            vec![0; 8],
        )
    }

    #[test]
    fn seqno_stamped_at_acceptance() {
        let port = Port::new(8);
        for _ in 0..3 {
            port.try_deliver(msg_to(&port, 0), false).ok().unwrap();
        }
        assert_eq!(port.in_flight(), 3);
    }

    #[test]
    fn limit_refuses_fourth() {
        let port = Port::new(3);
        for _ in 0..3 {
            assert!(port.try_deliver(msg_to(&port, 0), false).is_ok());
        }
        match port.try_deliver(msg_to(&port, 0), false) {
            Err((msg, DeliverFail::Full)) => msg.destroy(),
            _ => panic!("expected a full queue"),
        }
        // A send-once message is exempt.
        let exempt = Message::new(
            Arc::clone(&port),
            Disposition::SendOnce,
            MsgHeader {
                bits: MsgBits::empty(),
                id: 9,
            },
            Vec::new(),
        );
        assert!(port.try_deliver(exempt, false).is_ok());
    }

    #[test]
    fn release_after_destroy_is_a_no_op() {
        let port = Port::new(8);
        port.try_deliver(msg_to(&port, 1), false).ok().unwrap();
        // Dequeue the message, then let the port die before the receive
        // completes its accounting.
        let waiter = Arc::new(RcvWaiter::new(64));
        let msg = match port.mqueue.receive_or_enqueue(&waiter) {
            RcvPoll::Got(msg) => msg,
            _ => panic!("expected a queued message"),
        };
        port.destroy();
        port.release_one();
        assert_eq!(msg.header.id, 1);
        msg.destroy();
    }

    #[test]
    fn dead_port_refuses_delivery() {
        let port = Port::new(8);
        port.destroy();
        assert!(!port.is_alive());
        assert!(matches!(
            port.try_deliver(msg_to(&port, 0), false),
            Err((_, DeliverFail::Dead))
        ));
    }

    #[test]
    fn membership_moves_messages() {
        let port = Port::new(8);
        port.try_deliver(msg_to(&port, 1), false).ok().unwrap();
        let set = PortSet::new();
        assert!(set.add(&port));
        // The message now lives on the set's shared queue.
        assert_eq!(set.mqueue.extract_for_port(&port).len(), 1);
        assert!(set.remove(&port));
        assert!(!set.remove(&port));
    }

    #[test]
    fn double_membership_refused() {
        let port = Port::new(8);
        let a = PortSet::new();
        let b = PortSet::new();
        assert!(a.add(&port));
        assert!(!b.add(&port));
    }
}
