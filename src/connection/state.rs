//! Per-Connection State
//!
//! [`ConnectionState`] is everything a protocol handler may touch while it
//! parses and processes one request: the buffered input, the queued output,
//! the pending length and the per-request flags. It has no behaviour of its
//! own; the connection engine drives it.

use crate::connection::buffer::{OutputBuffer, Savepoint};
use crate::service::Service;
use bytes::BytesMut;
use std::sync::Arc;

/// Bytes needed before the first parse of a request is attempted.
pub const PROBE_LEN: usize = 1;

/// Initial input reservation, enough for one binary header.
pub const PROBE_RESERVE: usize = 24;

/// Buffers and flags of one client connection.
pub struct ConnectionState {
    /// Received bytes not yet consumed
    pub input: BytesMut,

    /// Responses queued for the next flush
    pub output: OutputBuffer,

    /// Bytes the current request occupies (or needs) in `input`
    pub pending: usize,

    /// Suppress the response to this request
    pub noreply: bool,

    /// Drain this request's bytes without processing it
    pub noprocess: bool,

    /// Terminate after this cycle
    pub close_connection: bool,

    /// Where the current request's response begins in `output`
    pub write_checkpoint: Savepoint,

    service: Arc<Service>,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("pending", &self.pending)
            .field("noreply", &self.noreply)
            .field("noprocess", &self.noprocess)
            .field("close_connection", &self.close_connection)
            .finish()
    }
}

impl ConnectionState {
    /// Creates the state for a newly accepted connection and counts it as open.
    pub fn new(service: Arc<Service>) -> Self {
        let input = service.buffers().acquire(PROBE_RESERVE);
        service.connection_opened();
        Self {
            input,
            output: OutputBuffer::new(),
            pending: PROBE_LEN,
            noreply: false,
            noprocess: false,
            close_connection: false,
            write_checkpoint: Savepoint::default(),
            service,
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Clears the flags that only apply to one request.
    pub fn reset_request_flags(&mut self) {
        self.noreply = false;
        self.noprocess = false;
    }

    /// The buffered bytes of the current request (possibly fewer than
    /// `pending` while a drained body is still arriving).
    #[cfg(test)]
    pub(crate) fn request(&self) -> &[u8] {
        &self.input[..self.pending.min(self.input.len())]
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        let input = std::mem::take(&mut self.input);
        self.service.buffers().release(input);
        self.service.connection_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;

    #[test]
    fn test_open_and_close_are_counted() {
        let service = Service::new("test", 1, Arc::new(StorageEngine::new()));
        let state = ConnectionState::new(Arc::clone(&service));
        assert_eq!(state.pending, PROBE_LEN);
        assert_eq!(service.stats().current_connections(), 1);

        drop(state);
        let snap = service.stats().snapshot();
        assert_eq!(snap.curr_conns, 0);
        assert_eq!(snap.total_conns, 1);
        assert_eq!(service.buffers().idle(), 1);
    }

    #[test]
    fn test_request_view_is_bounded() {
        let service = Service::new("test", 1, Arc::new(StorageEngine::new()));
        let mut state = ConnectionState::new(service);
        state.input.extend_from_slice(b"get a\r\nget b\r\n");
        state.pending = 7;
        assert_eq!(state.request(), b"get a\r\n");
        state.pending = 100;
        assert_eq!(state.request().len(), 14);
    }
}
