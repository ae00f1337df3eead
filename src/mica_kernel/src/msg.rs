//! The message engine: the send and receive calls a task invokes.
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::entry::{Name, Object, Right};
use crate::error::{CopyinError, ReceiveError, SendError};
use crate::message::{Disposition, Message, MsgBits, MsgHeader, MsgId, MsgSize, ReplyCap, SendOptions};
use crate::mqueue::RcvPoll;
use crate::port::DeliverFail;
use crate::space::Space;
use crate::wait::{RcvWaiter, RcvWake, SendWake, WaitSlot};

/// A refused send, handing the caller's message back untouched.
pub struct SendFailed {
    pub message: Message,
    pub code: SendError,
}

impl core::fmt::Debug for SendFailed {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "SendFailed({:?})", self.code)
    }
}

/// Resolve names into a sendable message.
///
/// The destination must carry a send or send-once right; a send-once right
/// is consumed by the copyin (one-shot semantics). The optional reply name
/// is resolved the same way and travels inside the message.
pub fn copyin_send(
    space: &Space,
    dest: Name,
    reply: Option<Name>,
    id: MsgId,
    bits: MsgBits,
    body: Vec<u8>,
) -> Result<Message, CopyinError> {
    let (dest_port, disposition) = copyin_cap(space, dest)?;
    let mut msg = Message::new(
        dest_port,
        disposition,
        MsgHeader { bits, id },
        body,
    );
    if let Some(reply) = reply {
        let (port, disposition) = copyin_cap(space, reply)?;
        msg = msg.with_reply(ReplyCap { port, disposition });
    }
    Ok(msg)
}

fn copyin_cap(
    space: &Space,
    name: Name,
) -> Result<(Arc<crate::port::Port>, Disposition), CopyinError> {
    let entry = space.lookup(name).ok_or(CopyinError::InvalidName)?;
    match (entry.right, entry.object) {
        (Right::Send, Some(Object::Port(port))) => Ok((port, Disposition::Send)),
        (Right::SendOnce, Some(Object::Port(_))) => {
            // Consume the right; the entry's reference moves into the
            // message.
            let stripped = space
                .destroy_entry(name)
                .map_err(|_| CopyinError::InvalidName)?;
            match stripped.object {
                Some(Object::Port(port)) => Ok((port, Disposition::SendOnce)),
                _ => Err(CopyinError::InvalidName),
            }
        }
        (Right::DeadName, _) => Err(CopyinError::InvalidName),
        _ => Err(CopyinError::WrongRight),
    }
}

/// Send a message, blocking while the destination's queue is at its limit
/// unless the message is exempt.
///
/// Sending to a dead port, and sending a message marked circular, destroy
/// the message and report success: the sender is not at fault and must not
/// see the receiver's state. Kernel-destined messages dispatch
/// synchronously and never block; a produced reply is sent on the same
/// call.
pub fn send(
    msg: Message,
    options: SendOptions,
    timeout: Option<Duration>,
) -> Result<(), SendFailed> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut msg = msg;
    let mut options = options;
    loop {
        if msg.dest.is_kernel() {
            let dest = Arc::clone(&msg.dest);
            match dest.kernel_dispatch(msg) {
                Some(reply) => {
                    // The reply leg must not block on a full queue.
                    msg = reply;
                    options |= SendOptions::OVERRIDE_LIMIT;
                    continue;
                }
                None => return Ok(()),
            }
        }
        if msg.header.bits.contains(MsgBits::CIRCULAR) {
            log::trace!("dropping circular message id {}", msg.header.id);
            msg.destroy();
            return Ok(());
        }
        let exempt = options.contains(SendOptions::OVERRIDE_LIMIT);
        match msg.dest.clone().try_deliver(msg, exempt) {
            Ok(()) => return Ok(()),
            Err((dead, DeliverFail::Dead)) => {
                // Not the sender's fault: silent, reference-correct drop.
                log::trace!("destination dead, dropping message id {}", dead.header.id);
                dead.destroy();
                return Ok(());
            }
            Err((full, DeliverFail::Full)) => {
                msg = full;
                let slot = Arc::new(WaitSlot::new());
                if !msg.dest.block_sender(&slot) {
                    // Room appeared (or the port died) in the meantime.
                    continue;
                }
                log::trace!("sender blocking on a full queue");
                match slot.wait_deadline(deadline) {
                    Some(SendWake::Retry) => continue,
                    Some(SendWake::Interrupted) => {
                        return Err(SendFailed {
                            message: msg,
                            code: SendError::Interrupted,
                        });
                    }
                    None => {
                        msg.dest.cancel_sender(&slot);
                        return Err(SendFailed {
                            message: msg,
                            code: SendError::Timeout,
                        });
                    }
                }
            }
        }
    }
}

/// Receive a message through a receive right or port-set right.
///
/// A queued message larger than `max_size` is reported as too-large with
/// the required size and stays queued for a retry with a bigger buffer. On
/// success one in-flight slot is released on the message's port, waking at
/// most one blocked sender.
pub fn receive(
    space: &Space,
    name: Name,
    max_size: MsgSize,
    timeout: Option<Duration>,
) -> Result<Message, ReceiveError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let entry = space.lookup(name).ok_or(ReceiveError::InvalidName)?;
    let waiter = Arc::new(RcvWaiter::new(max_size));
    let poll = match (entry.right, entry.object) {
        (Right::Receive, Some(Object::Port(port))) => {
            if !port.is_alive() {
                return Err(ReceiveError::PortDied);
            }
            if port.in_set() {
                // Its messages are on the set's shared queue.
                return Err(ReceiveError::PortChanged);
            }
            let poll = port.mqueue.receive_or_enqueue(&waiter);
            if matches!(poll, RcvPoll::Waiting) {
                // A destroy or membership change that ran entirely before
                // the waiter was enqueued has already broadcast, and its
                // wakeup would never arrive. Post the reason ourselves; a
                // real wake that landed first wins the slot.
                if !port.is_alive() {
                    port.mqueue.cancel_receiver(&waiter);
                    let _ = waiter.slot.post(RcvWake::PortDied);
                } else if port.in_set() {
                    port.mqueue.cancel_receiver(&waiter);
                    let _ = waiter.slot.post(RcvWake::PortChanged);
                }
            }
            poll
        }
        (Right::PortSet, Some(Object::Set(set))) => {
            if !set.is_alive() {
                return Err(ReceiveError::PortDied);
            }
            let poll = set.mqueue.receive_or_enqueue(&waiter);
            if matches!(poll, RcvPoll::Waiting) && !set.is_alive() {
                set.mqueue.cancel_receiver(&waiter);
                let _ = waiter.slot.post(RcvWake::PortDied);
            }
            poll
        }
        _ => return Err(ReceiveError::InvalidName),
    };
    match poll {
        RcvPoll::Got(msg) => Ok(finish_receive(msg)),
        RcvPoll::TooLarge(size) => Err(ReceiveError::TooLarge(size)),
        RcvPoll::Waiting => match waiter.slot.wait_deadline(deadline) {
            Some(RcvWake::Received(msg)) => Ok(finish_receive(msg)),
            Some(RcvWake::TooLarge(size)) => Err(ReceiveError::TooLarge(size)),
            Some(RcvWake::PortDied) => Err(ReceiveError::PortDied),
            Some(RcvWake::PortChanged) => Err(ReceiveError::PortChanged),
            Some(RcvWake::Interrupted) => Err(ReceiveError::Interrupted),
            None => {
                // Timed out: leave the waiter list before reporting.
                cancel_wait(space, name, &waiter);
                Err(ReceiveError::Timeout)
            }
        },
    }
}

fn finish_receive(msg: Message) -> Message {
    let port = Arc::clone(&msg.dest);
    log::trace!(
        "received message id {} seqno {} ({} bytes)",
        msg.header.id,
        msg.seqno(),
        msg.size(),
    );
    port.release_one();
    msg
}

fn cancel_wait(space: &Space, name: Name, waiter: &Arc<RcvWaiter>) {
    // Resolve again; the right may have moved or died while we waited, in
    // which case the broadcast already emptied the waiter list.
    match space.lookup(name).map(|e| (e.right, e.object)) {
        Some((Right::Receive, Some(Object::Port(port)))) => {
            port.mqueue.cancel_receiver(waiter);
        }
        Some((Right::PortSet, Some(Object::Set(set)))) => {
            set.mqueue.cancel_receiver(waiter);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::port::Port;

    fn setup() -> (Space, Arc<Port>, Name, Name) {
        let space = Space::new();
        let port = Port::new(4);
        let rcv = space.allocate(Entry::receive(Arc::clone(&port))).ok().unwrap();
        let snd = space.make_send_right(&port).unwrap();
        (space, port, rcv, snd)
    }

    fn build(space: &Space, dest: Name, id: MsgId, len: usize) -> Message {
        copyin_send(space, dest, None, id, MsgBits::empty(), vec![0; len]).unwrap()
    }

    #[test]
    fn send_then_receive() {
        let (space, _port, rcv, snd) = setup();
        send(build(&space, snd, 7, 16), SendOptions::empty(), None).unwrap();
        let msg = receive(&space, rcv, 64, None).unwrap();
        assert_eq!(msg.header.id, 7);
        assert_eq!(msg.seqno(), 1);
    }

    #[test]
    fn send_to_dead_port_silently_drops() {
        let (space, port, _rcv, snd) = setup();
        port.destroy();
        assert!(send(build(&space, snd, 1, 8), SendOptions::empty(), None).is_ok());
    }

    #[test]
    fn circular_message_silently_dropped() {
        let (space, _port, rcv, snd) = setup();
        let msg =
            copyin_send(&space, snd, None, 1, MsgBits::CIRCULAR, vec![0; 8]).unwrap();
        assert!(send(msg, SendOptions::empty(), None).is_ok());
        assert!(matches!(
            receive(&space, rcv, 64, Some(Duration::from_millis(5))),
            Err(ReceiveError::Timeout)
        ));
    }

    #[test]
    fn receive_with_wrong_right_fails() {
        let (space, _port, _rcv, snd) = setup();
        assert!(matches!(
            receive(&space, snd, 64, None),
            Err(ReceiveError::InvalidName)
        ));
    }

    #[test]
    fn send_once_right_is_consumed() {
        let (space, port, rcv, _snd) = setup();
        let once = space.allocate(Entry::send_once(Arc::clone(&port))).ok().unwrap();
        let msg =
            copyin_send(&space, once, None, 3, MsgBits::empty(), Vec::new()).unwrap();
        assert!(space.lookup(once).is_none());
        send(msg, SendOptions::empty(), None).unwrap();
        assert_eq!(receive(&space, rcv, 64, None).unwrap().header.id, 3);
        assert!(matches!(
            copyin_send(&space, once, None, 4, MsgBits::empty(), Vec::new()),
            Err(CopyinError::InvalidName)
        ));
    }

    #[test]
    fn kernel_port_dispatches_synchronously() {
        let space = Space::new();
        let reply_port = Port::new(4);
        let kernel = Port::with_handler(
            4,
            Box::new(|mut msg: Message| {
                let reply = msg.take_reply()?;
                Some(Message::new(
                    reply.port,
                    reply.disposition,
                    MsgHeader {
                        bits: MsgBits::empty(),
                        id: msg.header.id + 1,
                    },
                    Vec::new(),
                ))
            }),
        );
        let ksend = space.make_send_right(&kernel).unwrap();
        let reply_rcv = space
            .allocate(Entry::receive(Arc::clone(&reply_port)))
            .ok()
            .unwrap();
        let reply_once = space
            .allocate(Entry::send_once(Arc::clone(&reply_port)))
            .ok()
            .unwrap();
        let msg = copyin_send(
            &space,
            ksend,
            Some(reply_once),
            10,
            MsgBits::empty(),
            Vec::new(),
        )
        .unwrap();
        send(msg, SendOptions::empty(), None).unwrap();
        let reply = receive(&space, reply_rcv, 64, None).unwrap();
        assert_eq!(reply.header.id, 11);
    }
}
