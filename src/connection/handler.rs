//! Connection Handler Module
//!
//! This module drives individual client connections to FlashMC.
//! Each client gets its own handler task that runs a small state machine,
//! reading requests, handing them to the connection's [`Protocol`], and
//! flushing the queued responses.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned, protocol selected
//!        │
//!        ▼
//! 3. ┌──────────────────────────────────────────────┐
//!    │                                              │
//!    │  Reading ──► Parsing ──► Processing ──┐      │
//!    │     ▲           │  ▲                  │      │
//!    │     │  NeedMore │  └── batch < max ───┤      │
//!    │     └───────────┘                     ▼      │
//!    │     ▲                             Flushing   │
//!    │     └─────────────────────────────────┘      │
//!    │                                              │
//!    └──────────────────────┬───────────────────────┘
//!                           │ close_connection
//!                           ▼
//! 4. Closing: final flush, handler task ends
//! ```
//!
//! ## Buffer Management
//!
//! `con.pending` is the number of input bytes the current request needs (while
//! reading) or occupies (once framed). After a request is handled the input
//! advances by exactly that many bytes, reading and discarding late bytes if
//! the request was drained without being buffered. Bytes of the next request
//! that arrived early stay in the input buffer across flushes.
//!
//! Up to `batch_count` pipelined requests are answered with a single
//! vectored write.

use crate::connection::state::{ConnectionState, PROBE_LEN};
use crate::error::{ErrorKind, StoreError};
use crate::protocol::{self, ParseOutcome, Protocol};
use crate::service::{ProtocolMode, Service, ServiceConfig};
use bytes::{Buf, Bytes};
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

/// Maximum size a single request may grow the input buffer to (2 MB + slack).
///
/// Covers the largest value plus its command line or header; oversized values
/// are drained without buffering and never reach this limit.
const MAX_BUFFER_SIZE: usize = 2 * 1024 * 1024 + 4096;

/// States of the connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Parsing,
    Processing,
    Flushing,
    Closing,
}

/// Rolls back the current response and queues an error response in its place.
///
/// Protocol-defined error kinds are formatted as themselves; generic store
/// errors become a server error carrying the code and message.
pub fn escalate(protocol: &mut dyn Protocol, con: &mut ConnectionState, err: StoreError) {
    con.output.rollback(con.write_checkpoint);
    match err.protocol_kind() {
        Some(kind) => protocol.process_error(con, kind, err.message()),
        None => protocol.process_error(con, ErrorKind::ServerError, &err.to_string()),
    }
}

/// Handles a single client connection.
///
/// Generic over the transport so the same engine runs over TCP and over
/// in-memory streams.
pub struct ConnectionHandler<S> {
    /// The client stream
    stream: S,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffers and per-request flags
    con: ConnectionState,

    /// Selected on the first read unless given up front
    protocol: Option<Box<dyn Protocol>>,

    /// Requests handled since the last flush
    batch: usize,

    /// Configuration snapshot, refreshed after every flush
    config: ServiceConfig,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates a handler; the protocol is chosen from the service's
    /// [`ProtocolMode`] once the connection is running.
    pub fn new(stream: S, addr: SocketAddr, service: Arc<Service>) -> Self {
        let config = service.config();
        Self {
            stream,
            addr,
            con: ConnectionState::new(service),
            protocol: None,
            batch: 0,
            config,
        }
    }

    /// Creates a handler that speaks `protocol` regardless of configuration.
    pub fn with_protocol(
        stream: S,
        addr: SocketAddr,
        service: Arc<Service>,
        protocol: Box<dyn Protocol>,
    ) -> Self {
        let mut handler = Self::new(stream, addr, service);
        handler.protocol = Some(protocol);
        handler
    }

    /// Runs the connection until the client leaves or the protocol asks to
    /// close.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = match self.protocol.take() {
            Some(protocol) => self.serve(protocol).await,
            None => match self.negotiate().await {
                Ok(protocol) => self.serve(protocol).await,
                Err(e) => Err(e),
            },
        };

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        result
    }

    /// Picks the protocol, peeking at the first byte if negotiation is on.
    async fn negotiate(&mut self) -> Result<Box<dyn Protocol>, ConnectionError> {
        let mode = self.config.protocol;
        if mode == ProtocolMode::Negotiate {
            self.fill().await?;
        }
        let first = self.con.input.first().copied();
        let protocol = protocol::select(mode, first, self.con.service());
        debug!(client = %self.addr, protocol = protocol.name(), "Protocol selected");
        Ok(protocol)
    }

    async fn serve(&mut self, mut protocol: Box<dyn Protocol>) -> Result<(), ConnectionError> {
        let result = self.main_loop(protocol.as_mut()).await;

        // Whatever was answered before the failure still goes out.
        if result.is_err() && !self.con.output.is_empty() {
            if let Err(e) = self.write_output().await {
                trace!(client = %self.addr, error = %e, "Final flush failed");
            }
        }
        result
    }

    /// The read-parse-process-flush loop.
    async fn main_loop(&mut self, protocol: &mut dyn Protocol) -> Result<(), ConnectionError> {
        let mut state = State::Reading;
        loop {
            state = match state {
                State::Reading => {
                    self.fill().await?;
                    State::Parsing
                }
                State::Parsing => self.parse(protocol).await?,
                State::Processing => self.process(protocol).await?,
                State::Flushing => {
                    self.flush().await?;
                    State::Reading
                }
                State::Closing => {
                    self.flush().await?;
                    return Ok(());
                }
            };
        }
    }

    async fn parse(&mut self, protocol: &mut dyn Protocol) -> Result<State, ConnectionError> {
        self.con.reset_request_flags();
        self.con.write_checkpoint = self.con.output.checkpoint();

        match protocol.parse_request(&mut self.con) {
            Ok(ParseOutcome::Complete) => {
                if self.config.verbosity >= 2 {
                    debug!(
                        client = %self.addr,
                        len = self.con.pending,
                        noreply = self.con.noreply,
                        "Request parsed"
                    );
                }
                Ok(State::Processing)
            }
            Ok(ParseOutcome::NeedMore(needed)) => {
                trace!(
                    client = %self.addr,
                    buffered = self.con.input.len(),
                    needed = needed,
                    "Incomplete request, need more data"
                );
                self.con.pending = needed.max(self.con.input.len() + 1);
                Ok(State::Reading)
            }
            Err(e) => {
                debug!(client = %self.addr, error = %e, "Parse error");
                escalate(protocol, &mut self.con, e);
                self.skip().await?;
                if self.con.close_connection {
                    Ok(State::Closing)
                } else {
                    Ok(State::Flushing)
                }
            }
        }
    }

    async fn process(&mut self, protocol: &mut dyn Protocol) -> Result<State, ConnectionError> {
        if !self.con.noprocess {
            if let Err(e) = protocol.process_request(&mut self.con) {
                trace!(client = %self.addr, error = %e, "Request failed");
                escalate(protocol, &mut self.con, e);
            }
        }
        self.skip().await?;
        self.batch += 1;

        let next = if self.con.close_connection {
            State::Closing
        } else if !self.con.input.is_empty() && self.batch < self.config.batch_count {
            State::Parsing
        } else if self.con.noreply {
            self.batch = 0;
            State::Reading
        } else {
            State::Flushing
        };
        Ok(next)
    }

    /// Reads until `con.pending` bytes are buffered.
    async fn fill(&mut self) -> Result<(), ConnectionError> {
        if self.con.pending > MAX_BUFFER_SIZE {
            error!(
                client = %self.addr,
                size = self.con.pending,
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        while self.con.input.len() < self.con.pending {
            let missing = self.con.pending - self.con.input.len();
            self.con.input.reserve(missing.max(self.config.readahead));

            let n = self.stream.read_buf(&mut self.con.input).await?;
            if n == 0 {
                // Connection closed by client
                if self.con.input.is_empty() {
                    return Err(ConnectionError::ClientDisconnected);
                } else {
                    // Partial request in buffer
                    return Err(ConnectionError::UnexpectedEof);
                }
            }

            self.con.service().stats().bytes_read(n);
            trace!(client = %self.addr, bytes = n, "Read data");
        }
        Ok(())
    }

    /// Consumes exactly `con.pending` bytes of input, discarding bytes that
    /// arrive late, then rearms the probe.
    async fn skip(&mut self) -> Result<(), ConnectionError> {
        let mut remaining = self.con.pending;
        loop {
            let available = remaining.min(self.con.input.len());
            self.con.input.advance(available);
            remaining -= available;
            if remaining == 0 {
                break;
            }

            self.con.input.reserve(remaining.min(self.config.readahead));
            let n = self.stream.read_buf(&mut self.con.input).await?;
            if n == 0 {
                return Err(ConnectionError::UnexpectedEof);
            }
            self.con.service().stats().bytes_read(n);
        }
        self.con.pending = PROBE_LEN;
        Ok(())
    }

    /// Sends everything queued and prepares the buffers for the next cycle.
    async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.batch = 0;
        self.write_output().await?;

        if self.con.input.is_empty() {
            self.con.input.clear();
        }
        self.con.output.reset();
        self.con.write_checkpoint = self.con.output.checkpoint();

        self.config = self.con.service().config();
        self.con.input.reserve(self.config.readahead);
        Ok(())
    }

    async fn write_output(&mut self) -> Result<(), ConnectionError> {
        let mut chunks = self.con.output.take_chunks();
        let total: usize = chunks.iter().map(Bytes::len).sum();
        if total == 0 {
            return Ok(());
        }

        write_all_vectored(&mut self.stream, &mut chunks).await?;
        self.stream.flush().await?;

        self.con.service().stats().bytes_written(total);
        trace!(
            client = %self.addr,
            bytes = total,
            segments = chunks.len(),
            "Sent responses"
        );
        Ok(())
    }
}

/// Writes every chunk, resuming after partial writes.
async fn write_all_vectored<W>(stream: &mut W, chunks: &mut [Bytes]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut index = 0;
    while index < chunks.len() {
        let written = {
            let slices: Vec<IoSlice<'_>> = chunks[index..].iter().map(|c| IoSlice::new(c)).collect();
            stream.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        let mut n = written;
        while index < chunks.len() && n >= chunks[index].len() {
            n -= chunks[index].len();
            index += 1;
        }
        if n > 0 {
            chunks[index].advance(n);
        }
    }
    Ok(())
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial request)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler
/// and runs it to completion.
///
/// # Arguments
///
/// * `stream` - The client stream
/// * `addr` - The client's socket address
/// * `service` - The cache instance this connection belongs to
pub async fn handle_connection<S>(stream: S, addr: SocketAddr, service: Arc<Service>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let handler = ConnectionHandler::new(stream, addr, service);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
