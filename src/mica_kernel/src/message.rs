//! Messages and their headers.
use std::sync::Arc;

use bitflags::bitflags;

use crate::port::Port;

/// Message and buffer sizes, in bytes.
pub type MsgSize = u32;

/// Caller-defined message identifier, carried opaquely.
pub type MsgId = u32;

/// Per-port acceptance sequence number. Monotonically increasing with no
/// gaps among accepted messages.
pub type Seqno = u64;

bitflags! {
    /// Header flag bits.
    pub struct MsgBits: u32 {
        /// The message would complete a send-to-self loop. Marked by the
        /// copyin layer; the engine destroys such a message and reports
        /// success (the receiver is not at fault).
        const CIRCULAR = 1 << 0;
    }
}

bitflags! {
    /// Send-time option bits.
    pub struct SendOptions: u32 {
        /// Deliver even when the destination's queue is at its limit.
        const OVERRIDE_LIMIT = 1 << 0;
    }
}

/// How the destination right was copied in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Disposition {
    /// An ordinary send right; subject to the queue limit.
    Send,
    /// A send-once right; exempt from the queue limit so that replies can
    /// always be delivered.
    SendOnce,
}

/// Message header as seen by the receiver.
#[derive(Clone, Debug)]
pub struct MsgHeader {
    pub bits: MsgBits,
    pub id: MsgId,
}

/// A reply capability carried inside a message.
#[derive(Clone)]
pub struct ReplyCap {
    pub port: Arc<Port>,
    pub disposition: Disposition,
}

/// An in-flight message.
///
/// Exactly one holder owns a message at a time: the sending caller, a
/// queue, or the receiving caller. The destination reference is owned by
/// the message itself and released when the message is consumed or
/// destroyed.
pub struct Message {
    pub header: MsgHeader,
    pub body: Vec<u8>,
    pub(crate) dest: Arc<Port>,
    pub(crate) disposition: Disposition,
    pub(crate) reply: Option<ReplyCap>,
    pub(crate) seqno: Seqno,
}

impl Message {
    /// Build a message addressed to `dest`. The sequence number is stamped
    /// later, when the destination port accepts the message.
    pub fn new(
        dest: Arc<Port>,
        disposition: Disposition,
        header: MsgHeader,
        body: Vec<u8>,
    ) -> Self {
        Self {
            header,
            body,
            dest,
            disposition,
            reply: None,
            seqno: 0,
        }
    }

    /// Attach a reply capability.
    pub fn with_reply(mut self, reply: ReplyCap) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Size the receiver's buffer must accommodate.
    #[inline]
    pub fn size(&self) -> MsgSize {
        self.body.len() as MsgSize
    }

    /// The sequence number stamped at acceptance. Zero until accepted.
    #[inline]
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    /// The destination port.
    #[inline]
    pub fn dest(&self) -> &Arc<Port> {
        &self.dest
    }

    /// Take the reply capability out of the message, if any.
    pub fn take_reply(&mut self) -> Option<ReplyCap> {
        self.reply.take()
    }

    /// Destroy the message, releasing the capability references it
    /// carries.
    pub(crate) fn destroy(self) {
        log::trace!(
            "destroying message id {} ({} bytes) to {:p}",
            self.header.id,
            self.size(),
            Arc::as_ptr(&self.dest),
        );
        // Dropping the fields releases the destination and reply
        // references.
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.header.id)
            .field("size", &self.size())
            .field("seqno", &self.seqno)
            .field("disposition", &self.disposition)
            .finish_non_exhaustive()
    }
}
