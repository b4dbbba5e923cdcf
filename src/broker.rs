//! Callback contracts the multiplexer consumes. Brokers implement these to
//! receive bytes, write acknowledgements, failures and accepted connections
//! from the sockets they adopted.
//!
//! All callbacks run on the loop thread. They must not block and are free to
//! call back into the multiplexer; registration changes made from inside a
//! callback take effect at the end of the current loop iteration.

use crate::handle::{AcceptHandle, ConnectionHandle};
use crate::handler::Operation;
use crate::multiplexer::Multiplexer;

/// Callbacks of a broker managing one or more connected byte streams.
pub trait StreamManager {
    /// Bytes arrived on `hdl`. The slice is only valid for the duration of
    /// the call.
    fn consume(&self, dm: &Multiplexer, hdl: ConnectionHandle, data: &[u8]);

    /// Reports progress of a flush when write acknowledgements are enabled:
    /// `written` bytes went out in the last send, `remaining` bytes are
    /// still queued across both write buffers.
    fn data_transferred(
        &self,
        _dm: &Multiplexer,
        _hdl: ConnectionHandle,
        _written: usize,
        _remaining: usize,
    ) {
    }

    /// Unrecoverable I/O failure in direction `op`. Terminal for that
    /// direction; the stream is no longer registered for it.
    fn io_failure(&self, dm: &Multiplexer, hdl: ConnectionHandle, op: Operation);
}

/// Callbacks of a broker managing one or more listening sockets.
pub trait AcceptManager {
    /// A doorman has an accepted socket latched. The manager is expected to
    /// move it out via [`Multiplexer::accepted_socket`] and adopt it with
    /// [`Multiplexer::add_tcp_scribe_from`] before returning.
    fn new_connection(&self, dm: &Multiplexer, hdl: AcceptHandle);
}
