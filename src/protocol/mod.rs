//! Protocol Module
//!
//! FlashMC speaks both memcached wire formats. Each one is a [`Protocol`]
//! implementation; the connection engine is written against the trait only.
//!
//! ## Callback Contract
//!
//! ```text
//!   parse_request(con)   -> Complete | NeedMore(n) | Err
//!   process_request(con) -> Ok | Err
//!   process_error(con, kind, message)
//! ```
//!
//! - On `Complete`, `con.pending` is the exact length of the framed request.
//! - On `NeedMore(n)`, `n` is the total number of buffered bytes required
//!   before parsing can succeed.
//! - On `Err`, `con.pending` is the number of bytes to discard. A parser that
//!   cannot resynchronise sets `con.close_connection` and never asks to discard
//!   more than is buffered.
//! - A parser may set `con.noreply` (suppress the response) or `con.noprocess`
//!   (drain without processing).
//!
//! A protocol holds the request it framed until `process_request` runs.
//!
//! ## Selection
//!
//! With [`ProtocolMode::Negotiate`] the first byte decides: the binary request
//! magic `0x80` selects the binary protocol, anything else the text protocol.

pub mod binary;
pub mod text;

pub use binary::BinaryProtocol;
pub use text::TextProtocol;

use crate::commands::CommandHandler;
use crate::connection::ConnectionState;
use crate::error::{ErrorKind, StoreResult};
use crate::service::{ProtocolMode, Service};
use std::sync::Arc;

/// First byte of every binary request.
pub const BINARY_REQUEST_MAGIC: u8 = 0x80;

/// First byte of every binary response.
pub const BINARY_RESPONSE_MAGIC: u8 = 0x81;

/// Result of a successful `parse_request` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A whole request is framed; `pending` holds its length
    Complete,
    /// At least this many buffered bytes are needed
    NeedMore(usize),
}

/// A wire protocol, as seen by the connection engine.
pub trait Protocol: Send {
    /// Short name, for logging.
    fn name(&self) -> &'static str;

    /// Frames the next request from `con.input`.
    fn parse_request(&mut self, con: &mut ConnectionState) -> StoreResult<ParseOutcome>;

    /// Executes the framed request and queues its response in `con.output`.
    fn process_request(&mut self, con: &mut ConnectionState) -> StoreResult<()>;

    /// Queues an error response for the current request.
    fn process_error(&mut self, con: &mut ConnectionState, kind: ErrorKind, message: &str);
}

/// Picks the protocol for a connection.
///
/// `first_byte` is only consulted in [`ProtocolMode::Negotiate`].
pub fn select(mode: ProtocolMode, first_byte: Option<u8>, service: &Arc<Service>) -> Box<dyn Protocol> {
    let commands = CommandHandler::new(Arc::clone(service));
    let binary = match mode {
        ProtocolMode::Text => false,
        ProtocolMode::Binary => true,
        ProtocolMode::Negotiate => first_byte == Some(BINARY_REQUEST_MAGIC),
    };

    if binary {
        Box::new(BinaryProtocol::new(commands))
    } else {
        Box::new(TextProtocol::new(commands))
    }
}
