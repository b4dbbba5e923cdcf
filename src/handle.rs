//! Opaque handles identifying sockets adopted by (or destined for) a
//! multiplexer. A handle carries the underlying native socket and nothing
//! else; conversion in both directions is explicit.

use crate::sys::NativeHandle;

macro_rules! socket_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub fn from_int(id: u64) -> $name {
                $name(id)
            }

            pub fn id(&self) -> u64 {
                self.0
            }

            pub(crate) fn from_socket(fd: NativeHandle) -> $name {
                $name(fd as u64)
            }

            pub(crate) fn socket(&self) -> NativeHandle {
                self.0 as NativeHandle
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

socket_handle!(
    /// Identifies one connected byte-stream socket.
    ConnectionHandle
);

socket_handle!(
    /// Identifies one listening socket.
    AcceptHandle
);
