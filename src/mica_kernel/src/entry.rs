//! Capability names and name-space entries.
//!
//! A [`Name`] packs a table index into its low 24 bits and a generation
//! counter into its high 8 bits. The generation stored with the slot must
//! match the one in the name, so a name outlives its entry only as a stale
//! value that every lookup rejects. No live entry has generation zero, which
//! reserves [`Name::NULL`] as "no capability".
use std::sync::Arc;

use crate::port::{Port, PortSet};

/// Reuse counter stored per slot. Wraps around skipping zero.
pub type Generation = u8;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Highest index a name can carry.
pub(crate) const MAX_INDEX: u32 = INDEX_MASK;

/// A task-visible capability name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(u32);

impl Name {
    /// The null name. Denotes no capability; never matches a live entry.
    pub const NULL: Self = Self(0);

    /// The dead name sentinel. The right existed but its object is gone.
    pub const DEAD: Self = Self(u32::MAX);

    pub(crate) fn from_parts(index: u32, generation: Generation) -> Self {
        debug_assert!(index <= INDEX_MASK);
        debug_assert_ne!(generation, 0);
        Self((generation as u32) << INDEX_BITS | index)
    }

    /// The table-index bits.
    #[inline]
    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    /// The generation bits.
    #[inline]
    pub fn generation(self) -> Generation {
        (self.0 >> INDEX_BITS) as Generation
    }

    /// Get the raw integer value, e.g. to hand across the system-call
    /// boundary.
    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Reconstruct a name from its raw integer value.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl core::fmt::Debug for Name {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if *self == Self::NULL {
            f.write_str("Name::NULL")
        } else if *self == Self::DEAD {
            f.write_str("Name::DEAD")
        } else {
            write!(f, "Name({}g{})", self.index(), self.generation())
        }
    }
}

/// The successor of `g` in the wrap-around generation sequence. Never zero.
pub(crate) fn next_generation(g: Generation) -> Generation {
    match g.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

/// What kind of capability an entry carries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Right {
    /// May enqueue messages on the port.
    Send,
    /// May dequeue messages from the port. At most one per port.
    Receive,
    /// May enqueue exactly one message; consumed by use.
    SendOnce,
    /// Names a port set; receivable like a receive right.
    PortSet,
    /// The right's object has been destroyed.
    DeadName,
}

/// The kernel object an entry refers to.
#[derive(Clone)]
pub enum Object {
    Port(Arc<Port>),
    Set(Arc<PortSet>),
}

impl Object {
    /// Stable identity of the referent, for the reverse send-right index.
    pub(crate) fn id(&self) -> usize {
        match self {
            Self::Port(p) => Arc::as_ptr(p) as usize,
            Self::Set(s) => Arc::as_ptr(s) as usize,
        }
    }
}

impl core::fmt::Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Port(p) => write!(f, "Port({:p})", Arc::as_ptr(p)),
            Self::Set(s) => write!(f, "Set({:p})", Arc::as_ptr(s)),
        }
    }
}

/// A pending dead-name notification registration.
#[derive(Clone)]
pub struct NotifyRequest {
    /// Where the notification message gets sent when the entry's object
    /// dies.
    pub notify: Arc<Port>,
}

impl core::fmt::Debug for NotifyRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "NotifyRequest({:p})", Arc::as_ptr(&self.notify))
    }
}

/// One capability slot's metadata and object reference.
///
/// An entry holding `object` owns one strong reference on it. The
/// generation is not stored here; it lives in the table slot or the tree
/// key so that a freed slot remembers it across reuse.
#[derive(Clone, Debug)]
pub struct Entry {
    pub right: Right,
    pub object: Option<Object>,
    pub request: Option<NotifyRequest>,
    /// Set on a table-resident entry while at least one same-index entry
    /// lives in the overflow tree.
    pub(crate) collision: bool,
}

impl Entry {
    pub fn new(right: Right, object: Option<Object>) -> Self {
        Self {
            right,
            object,
            request: None,
            collision: false,
        }
    }

    /// A receive right for `port`.
    pub fn receive(port: Arc<Port>) -> Self {
        Self::new(Right::Receive, Some(Object::Port(port)))
    }

    /// A send right for `port`.
    pub fn send(port: Arc<Port>) -> Self {
        Self::new(Right::Send, Some(Object::Port(port)))
    }

    /// A send-once right for `port`.
    pub fn send_once(port: Arc<Port>) -> Self {
        Self::new(Right::SendOnce, Some(Object::Port(port)))
    }

    /// A port-set right for `set`.
    pub fn port_set(set: Arc<PortSet>) -> Self {
        Self::new(Right::PortSet, Some(Object::Set(set)))
    }

    /// A dead name. Holds no object.
    pub fn dead() -> Self {
        Self::new(Right::DeadName, None)
    }

    /// `true` if the entry carries neither an object reference nor a
    /// pending notification, i.e. it may be deallocated.
    pub(crate) fn is_stripped(&self) -> bool {
        self.object.is_none() && self.request.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        let name = Name::from_parts(0x00_1234, 7);
        assert_eq!(name.index(), 0x1234);
        assert_eq!(name.generation(), 7);
        assert_eq!(Name::from_raw(name.as_raw()), name);
    }

    #[test]
    fn generation_wraps_skipping_zero() {
        assert_eq!(next_generation(1), 2);
        assert_eq!(next_generation(254), 255);
        assert_eq!(next_generation(255), 1);
    }

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(Name::NULL, Name::DEAD);
        // Any live name has a non-zero generation and so can't be NULL.
        assert_ne!(Name::from_parts(0, 1), Name::NULL);
    }
}
