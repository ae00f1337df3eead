//! Capability-based IPC core: per-task port name spaces and message
//! queues.
//!
//! Tasks hold capabilities to ports through small integer [`Name`]s
//! managed by a per-task [`Space`], a growable slot table with an
//! overflow tree, generation-tagged against stale-name reuse. The message
//! engine ([`msg::send`], [`msg::receive`]) delivers messages in send
//! order with at-most-once semantics, handing a message directly to a
//! blocked receiver whenever one is waiting instead of cycling it through
//! the queue.
//!
//! Blocking is real thread suspension; structure locks are short-held
//! spinlocks acquired in the fixed dominance order Space → PortSet → Port
//! → MQueue (checked in debug builds).
//!
//! [`Name`]: entry::Name
//! [`Space`]: space::Space

mod klock;
mod mqueue;
mod wait;

pub mod entry;
pub mod error;
pub mod message;
pub mod msg;
pub mod port;
pub mod space;

pub use crate::entry::{Entry, Name, Object, Right};
pub use crate::error::ResultCode;
pub use crate::message::{Disposition, Message, MsgBits, MsgHeader, SendOptions};
pub use crate::port::{Port, PortSet};
pub use crate::space::Space;
