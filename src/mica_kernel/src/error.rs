//! Result codes and per-operation error types.
use core::{fmt, mem::transmute};

use crate::message::MsgSize;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use mica_kernel::error::ResultCode;
            /// assert_eq!(ResultCode::InvalidName.as_str(), "InvalidName");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the IPC layer can return
    /// across the system-call boundary.
    ///
    /// Failure codes are negative so that a raw code can be tested with a
    /// single sign check, mirroring the kernel return-code convention the
    /// message interface is modeled on.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is
        /// available.
        Success = 0,
        /// The name doesn't denote a live entry, its generation is stale, or
        /// the entry's right is of the wrong kind for the operation.
        InvalidName = -15,
        /// A live entry with that name exists but carries an incompatible
        /// right.
        WrongRight = -16,
        /// The name space has no free entry and cannot grow any further.
        Exhausted = -17,
        /// A control-block allocation failed.
        ResourceShortage = -18,
        /// The name space has been terminated.
        SpaceDead = -19,
        /// The pending message does not fit in the receiver's buffer. The
        /// required size is reported alongside this code.
        TooLarge = -33,
        /// The port or port set was destroyed while the caller was waiting.
        PortDied = -34,
        /// The port changed port-set membership while the caller was waiting.
        PortChanged = -35,
        /// The wait was interrupted.
        Interrupted = -49,
        /// The operation timed out.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod allocate_error {}
    /// Error type for [`Space::allocate`] and [`Space::make_send_right`].
    ///
    /// [`Space::allocate`]: crate::space::Space::allocate
    /// [`Space::make_send_right`]: crate::space::Space::make_send_right
    pub enum AllocateError {
        /// The free list is empty and the table is at its maximum size.
        Exhausted,
        /// A control-block allocation failed.
        ResourceShortage,
        /// The name space has been terminated.
        SpaceDead,
    }
}

define_error! {
    mod allocate_name_error {}
    /// Error type for [`Space::allocate_name`].
    ///
    /// [`Space::allocate_name`]: crate::space::Space::allocate_name
    pub enum AllocateNameError {
        /// A control-block allocation failed.
        ResourceShortage,
        /// The name space has been terminated.
        SpaceDead,
    }
}

define_error! {
    mod deallocate_error {}
    /// Error type for [`Space::deallocate`] and [`Space::destroy_entry`].
    ///
    /// [`Space::deallocate`]: crate::space::Space::deallocate
    /// [`Space::destroy_entry`]: crate::space::Space::destroy_entry
    pub enum DeallocateError {
        /// The name doesn't denote a live entry.
        InvalidName,
    }
}

define_error! {
    mod copyin_error {}
    /// Error type for [`copyin_send`].
    ///
    /// [`copyin_send`]: crate::msg::copyin_send
    pub enum CopyinError {
        /// The name doesn't denote a live entry.
        InvalidName,
        /// The entry doesn't carry the right the operation requires.
        WrongRight,
    }
}

define_error! {
    mod send_error {}
    /// Error type for [`send`]. Note that a dead destination and a circular
    /// message are deliberately *not* errors (the message is destroyed and
    /// success is reported).
    ///
    /// [`send`]: crate::msg::send
    pub enum SendError {
        /// The wait for queue space was interrupted.
        Interrupted,
        /// The wait for queue space timed out.
        Timeout,
    }
}

/// Error type for [`receive`].
///
/// Hand-rolled (unlike the other error types in this module) because
/// [`TooLarge`] carries the required message size.
///
/// [`receive`]: crate::msg::receive
/// [`TooLarge`]: ReceiveError::TooLarge
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReceiveError {
    /// The name doesn't denote a receive right or port set, or its
    /// generation is stale.
    InvalidName,
    /// The pending message does not fit in the caller's buffer; the payload
    /// is the required size. The message stays queued and can be retrieved
    /// by a retry with a larger buffer.
    TooLarge(MsgSize),
    /// The port or the port set was destroyed while the caller was waiting.
    PortDied,
    /// The port was moved into a port set while the caller was waiting on
    /// its own queue.
    PortChanged,
    /// The wait was interrupted.
    Interrupted,
    /// The wait timed out.
    Timeout,
}

impl From<ReceiveError> for ResultCode {
    #[inline]
    fn from(x: ReceiveError) -> Self {
        match x {
            ReceiveError::InvalidName => Self::InvalidName,
            ReceiveError::TooLarge(_) => Self::TooLarge,
            ReceiveError::PortDied => Self::PortDied,
            ReceiveError::PortChanged => Self::PortChanged,
            ReceiveError::Interrupted => Self::Interrupted,
            ReceiveError::Timeout => Self::Timeout,
        }
    }
}

impl From<CopyinError> for ReceiveError {
    #[inline]
    fn from(x: CopyinError) -> Self {
        // A wrong-kind name is still just an unusable name from the
        // receiver's point of view.
        match x {
            CopyinError::InvalidName | CopyinError::WrongRight => Self::InvalidName,
        }
    }
}

impl fmt::Debug for ReceiveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooLarge(size) => write!(f, "TooLarge({size})"),
            other => ResultCode::from(*other).fmt(f),
        }
    }
}

#[cfg(test)]
mod receive_error_tests {
    use super::*;

    #[test]
    fn to_result_code() {
        assert_eq!(ResultCode::InvalidName, ReceiveError::InvalidName.into());
        assert_eq!(ResultCode::TooLarge, ReceiveError::TooLarge(128).into());
        assert_eq!(ResultCode::PortDied, ReceiveError::PortDied.into());
        assert_eq!(ResultCode::PortChanged, ReceiveError::PortChanged.into());
        assert_eq!(ResultCode::Interrupted, ReceiveError::Interrupted.into());
        assert_eq!(ResultCode::Timeout, ReceiveError::Timeout.into());
    }

    #[test]
    fn debug_carries_size() {
        assert_eq!(format!("{:?}", ReceiveError::TooLarge(128)), "TooLarge(128)");
        assert_eq!(format!("{:?}", ReceiveError::PortDied), "PortDied");
    }
}
