//! memcached Binary Protocol
//!
//! Every packet starts with a fixed 24-byte header (big-endian):
//!
//! ```text
//!  0        1        2        3
//! ┌────────┬────────┬─────────────────┐
//! │ magic  │ opcode │   key length    │   0
//! ├────────┼────────┼─────────────────┤
//! │ extras │  type  │ vbucket/status  │   4
//! ├────────┴────────┴─────────────────┤
//! │         total body length         │   8
//! ├───────────────────────────────────┤
//! │              opaque               │  12
//! ├───────────────────────────────────┤
//! │                cas                │  16
//! │                                   │
//! └───────────────────────────────────┘
//! body: extras, key, value
//! ```
//!
//! Quiet opcodes (`GetQ`, `SetQ`, ...) suppress success responses; the
//! connection engine holds their output until the next non-quiet request.

use crate::commands::{ArithOp, CommandHandler, StoreMode, MAX_VALUE_SIZE};
use crate::connection::ConnectionState;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::protocol::{ParseOutcome, Protocol, BINARY_REQUEST_MAGIC, BINARY_RESPONSE_MAGIC};
use crate::storage::Record;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of a request or response header.
pub const HEADER_LEN: usize = 24;

/// Largest body accepted: a maximal value plus room for key and extras.
const MAX_BODY_LEN: usize = MAX_VALUE_SIZE + 1024;

/// Status of a successful response.
const STATUS_OK: u16 = 0;

/// Exptime value in an incr/decr request meaning "do not create".
const NO_AUTO_CREATE: u32 = 0xffff_ffff;

/// Binary protocol opcodes.
pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const INCREMENT: u8 = 0x05;
    pub const DECREMENT: u8 = 0x06;
    pub const QUIT: u8 = 0x07;
    pub const FLUSH: u8 = 0x08;
    pub const GETQ: u8 = 0x09;
    pub const NOOP: u8 = 0x0a;
    pub const VERSION: u8 = 0x0b;
    pub const GETK: u8 = 0x0c;
    pub const GETKQ: u8 = 0x0d;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const STAT: u8 = 0x10;
    pub const SETQ: u8 = 0x11;
    pub const ADDQ: u8 = 0x12;
    pub const REPLACEQ: u8 = 0x13;
    pub const DELETEQ: u8 = 0x14;
    pub const INCREMENTQ: u8 = 0x15;
    pub const DECREMENTQ: u8 = 0x16;
    pub const QUITQ: u8 = 0x17;
    pub const FLUSHQ: u8 = 0x18;
    pub const APPENDQ: u8 = 0x19;
    pub const PREPENDQ: u8 = 0x1a;
    pub const VERBOSITY: u8 = 0x1b;
    pub const TOUCH: u8 = 0x1c;
    pub const GAT: u8 = 0x1d;
    pub const GATQ: u8 = 0x1e;
}

/// A decoded packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    /// vbucket in requests, status in responses
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Decodes a header from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn decode(mut buf: &[u8]) -> Self {
        Self {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            key_len: buf.get_u16(),
            extras_len: buf.get_u8(),
            data_type: buf.get_u8(),
            status: buf.get_u16(),
            body_len: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_len);
        buf.put_u8(self.extras_len);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status);
        buf.put_u32(self.body_len);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }
}

/// Returns true for opcodes whose success response is suppressed.
fn is_quiet(op: u8) -> bool {
    matches!(
        op,
        opcode::GETQ
            | opcode::GETKQ
            | opcode::SETQ
            | opcode::ADDQ
            | opcode::REPLACEQ
            | opcode::DELETEQ
            | opcode::INCREMENTQ
            | opcode::DECREMENTQ
            | opcode::QUITQ
            | opcode::FLUSHQ
            | opcode::APPENDQ
            | opcode::PREPENDQ
            | opcode::GATQ
    )
}

/// Checks the extras length an opcode requires and whether it needs a key.
fn validate(header: &Header) -> StoreResult<()> {
    let extras = header.extras_len;
    let has_key = header.key_len > 0;
    let ok = match header.opcode {
        opcode::GET | opcode::GETQ | opcode::GETK | opcode::GETKQ => extras == 0 && has_key,
        opcode::SET | opcode::SETQ | opcode::ADD | opcode::ADDQ | opcode::REPLACE
        | opcode::REPLACEQ => extras == 8 && has_key,
        opcode::APPEND | opcode::APPENDQ | opcode::PREPEND | opcode::PREPENDQ => {
            extras == 0 && has_key
        }
        opcode::DELETE | opcode::DELETEQ => extras == 0 && has_key,
        opcode::INCREMENT | opcode::INCREMENTQ | opcode::DECREMENT | opcode::DECREMENTQ => {
            extras == 20 && has_key
        }
        opcode::TOUCH | opcode::GAT | opcode::GATQ => extras == 4 && has_key,
        opcode::FLUSH | opcode::FLUSHQ => extras == 0 || extras == 4,
        opcode::VERBOSITY => extras == 4,
        opcode::QUIT | opcode::QUITQ | opcode::NOOP | opcode::VERSION | opcode::STAT => true,
        _ => return Err(StoreError::kind(ErrorKind::UnknownCommand)),
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::kind(ErrorKind::InvalidArguments))
    }
}

/// A framed binary request.
#[derive(Debug, Clone)]
struct BinaryRequest {
    header: Header,
    extras: Bytes,
    key: Bytes,
    value: Bytes,
}

/// The memcached binary protocol.
pub struct BinaryProtocol {
    commands: CommandHandler,
    /// Header of the request being handled, echoed in error responses
    header: Header,
    request: Option<BinaryRequest>,
}

impl BinaryProtocol {
    pub fn new(commands: CommandHandler) -> Self {
        Self {
            commands,
            header: Header::default(),
            request: None,
        }
    }

    fn execute(&self, con: &mut ConnectionState, req: BinaryRequest) -> StoreResult<()> {
        let header = &req.header;
        let quiet = is_quiet(header.opcode);
        let mut extras = req.extras.clone();

        match header.opcode {
            opcode::GET | opcode::GETQ | opcode::GETK | opcode::GETKQ => {
                match self.commands.get(&req.key)? {
                    Some(record) => {
                        let with_key = matches!(header.opcode, opcode::GETK | opcode::GETKQ);
                        write_record(con, header, &record, with_key);
                    }
                    None if quiet => {}
                    None => return Err(StoreError::kind(ErrorKind::KeyNotFound)),
                }
            }
            opcode::GAT | opcode::GATQ => {
                let exptime = i64::from(extras.get_u32());
                match self.commands.get_and_touch(&req.key, exptime)? {
                    Some(record) => write_record(con, header, &record, false),
                    None if quiet => {}
                    None => return Err(StoreError::kind(ErrorKind::KeyNotFound)),
                }
            }
            opcode::SET | opcode::SETQ | opcode::ADD | opcode::ADDQ | opcode::REPLACE
            | opcode::REPLACEQ => {
                let flags = extras.get_u32();
                let exptime = i64::from(extras.get_u32());
                let mode = match header.opcode {
                    opcode::ADD | opcode::ADDQ => StoreMode::Add,
                    _ if header.cas != 0 => StoreMode::Cas(header.cas),
                    opcode::REPLACE | opcode::REPLACEQ => StoreMode::Replace,
                    _ => StoreMode::Set,
                };
                let cas = self
                    .commands
                    .store(mode, req.key.clone(), req.value.clone(), flags, exptime)
                    .map_err(|e| remap_not_stored(e, mode))?;
                if !quiet {
                    write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), cas);
                }
            }
            opcode::APPEND | opcode::APPENDQ | opcode::PREPEND | opcode::PREPENDQ => {
                let mode = if matches!(header.opcode, opcode::APPEND | opcode::APPENDQ) {
                    StoreMode::Append
                } else {
                    StoreMode::Prepend
                };
                let cas = self
                    .commands
                    .store(mode, req.key.clone(), req.value.clone(), 0, 0)?;
                if !quiet {
                    write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), cas);
                }
            }
            opcode::DELETE | opcode::DELETEQ => {
                self.commands.delete(&req.key)?;
                if !quiet {
                    write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), 0);
                }
            }
            opcode::INCREMENT | opcode::INCREMENTQ | opcode::DECREMENT | opcode::DECREMENTQ => {
                let delta = extras.get_u64();
                let initial = extras.get_u64();
                let exptime = extras.get_u32();
                let op = if matches!(header.opcode, opcode::INCREMENT | opcode::INCREMENTQ) {
                    ArithOp::Incr
                } else {
                    ArithOp::Decr
                };
                let create = (exptime != NO_AUTO_CREATE).then(|| (initial, i64::from(exptime)));
                let (value, cas) = self.commands.arith(op, req.key.clone(), delta, create)?;
                if !quiet {
                    let body = Bytes::copy_from_slice(&value.to_be_bytes());
                    write_response(con, header, STATUS_OK, &[], &[], body, cas);
                }
            }
            opcode::TOUCH => {
                let exptime = i64::from(extras.get_u32());
                self.commands.touch(&req.key, exptime)?;
                write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), 0);
            }
            opcode::FLUSH | opcode::FLUSHQ => {
                let delay = if extras.is_empty() {
                    0
                } else {
                    i64::from(extras.get_u32())
                };
                self.commands.flush_all(delay)?;
                if !quiet {
                    write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), 0);
                }
            }
            opcode::VERBOSITY => {
                self.commands.verbosity(extras.get_u32());
                write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), 0);
            }
            opcode::VERSION => {
                let version = Bytes::from_static(self.commands.version().as_bytes());
                write_response(con, header, STATUS_OK, &[], &[], version, 0);
            }
            opcode::STAT => {
                for (name, value) in self.commands.stats()? {
                    write_response(
                        con,
                        header,
                        STATUS_OK,
                        &[],
                        name.as_bytes(),
                        Bytes::from(value),
                        0,
                    );
                }
                write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), 0);
            }
            opcode::NOOP => {
                write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), 0);
            }
            opcode::QUIT | opcode::QUITQ => {
                if !quiet {
                    write_response(con, header, STATUS_OK, &[], &[], Bytes::new(), 0);
                }
                con.close_connection = true;
            }
            _ => return Err(StoreError::kind(ErrorKind::UnknownCommand)),
        }
        Ok(())
    }
}

impl Protocol for BinaryProtocol {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn parse_request(&mut self, con: &mut ConnectionState) -> StoreResult<ParseOutcome> {
        self.request = None;
        self.header = Header::default();

        if con.input.len() < HEADER_LEN {
            return Ok(ParseOutcome::NeedMore(HEADER_LEN));
        }

        let header = Header::decode(&con.input[..HEADER_LEN]);
        if header.magic != BINARY_REQUEST_MAGIC {
            con.pending = con.input.len();
            con.close_connection = true;
            return Err(StoreError::protocol(
                ErrorKind::InvalidArguments,
                "invalid magic",
            ));
        }
        self.header = header;

        let body_len = header.body_len as usize;
        let total = HEADER_LEN + body_len;
        if usize::from(header.key_len) + usize::from(header.extras_len) > body_len {
            con.pending = con.input.len();
            con.close_connection = true;
            return Err(StoreError::protocol(
                ErrorKind::InvalidArguments,
                "invalid body length",
            ));
        }
        if is_quiet(header.opcode) {
            con.noreply = true;
        }
        if body_len > MAX_BODY_LEN {
            con.pending = total;
            con.noprocess = true;
            write_response(
                con,
                &header,
                ErrorKind::TooLarge.code(),
                &[],
                &[],
                Bytes::from_static(ErrorKind::TooLarge.message().as_bytes()),
                0,
            );
            return Ok(ParseOutcome::Complete);
        }
        if con.input.len() < total {
            return Ok(ParseOutcome::NeedMore(total));
        }

        con.pending = total;
        validate(&header)?;

        let extras_end = HEADER_LEN + usize::from(header.extras_len);
        let key_end = extras_end + usize::from(header.key_len);
        self.request = Some(BinaryRequest {
            header,
            extras: Bytes::copy_from_slice(&con.input[HEADER_LEN..extras_end]),
            key: Bytes::copy_from_slice(&con.input[extras_end..key_end]),
            value: Bytes::copy_from_slice(&con.input[key_end..total]),
        });
        Ok(ParseOutcome::Complete)
    }

    fn process_request(&mut self, con: &mut ConnectionState) -> StoreResult<()> {
        match self.request.take() {
            Some(request) => self.execute(con, request),
            None => Ok(()),
        }
    }

    fn process_error(&mut self, con: &mut ConnectionState, kind: ErrorKind, message: &str) {
        let header = self.header;
        write_response(
            con,
            &header,
            kind.code(),
            &[],
            &[],
            Bytes::copy_from_slice(message.as_bytes()),
            0,
        );
    }
}

/// Binary `add` reports an existing key as `KeyExists`, `replace` a missing
/// one as `KeyNotFound`.
fn remap_not_stored(err: StoreError, mode: StoreMode) -> StoreError {
    match (err.protocol_kind(), mode) {
        (Some(ErrorKind::NotStored), StoreMode::Add) => StoreError::kind(ErrorKind::KeyExists),
        (Some(ErrorKind::NotStored), StoreMode::Replace) => {
            StoreError::kind(ErrorKind::KeyNotFound)
        }
        _ => err,
    }
}

fn write_record(con: &mut ConnectionState, request: &Header, record: &Record, with_key: bool) {
    let key: &[u8] = if with_key { &record.key } else { &[] };
    write_response(
        con,
        request,
        STATUS_OK,
        &record.flags.to_be_bytes(),
        key,
        record.value.clone(),
        record.cas,
    );
}

fn write_response(
    con: &mut ConnectionState,
    request: &Header,
    status: u16,
    extras: &[u8],
    key: &[u8],
    value: Bytes,
    cas: u64,
) {
    let header = Header {
        magic: BINARY_RESPONSE_MAGIC,
        opcode: request.opcode,
        key_len: key.len() as u16,
        extras_len: extras.len() as u8,
        data_type: 0,
        status,
        body_len: (extras.len() + key.len() + value.len()) as u32,
        opaque: request.opaque,
        cas,
    };

    let mut head = BytesMut::with_capacity(HEADER_LEN + extras.len() + key.len());
    header.encode(&mut head);
    head.extend_from_slice(extras);
    head.extend_from_slice(key);
    con.output.put_slice(&head);
    con.output.put_bytes(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::handler::escalate;
    use crate::connection::state::PROBE_LEN;
    use crate::service::Service;
    use crate::storage::StorageEngine;
    use std::sync::Arc;

    fn setup() -> (BinaryProtocol, ConnectionState) {
        let store = Arc::new(StorageEngine::new());
        store.create_space(512, "cache").unwrap();
        let service = Service::new("test", 512, store);
        let protocol = BinaryProtocol::new(CommandHandler::new(Arc::clone(&service)));
        (protocol, ConnectionState::new(service))
    }

    fn request(op: u8, extras: &[u8], key: &[u8], value: &[u8], cas: u64) -> Vec<u8> {
        let header = Header {
            magic: BINARY_REQUEST_MAGIC,
            opcode: op,
            key_len: key.len() as u16,
            extras_len: extras.len() as u8,
            data_type: 0,
            status: 0,
            body_len: (extras.len() + key.len() + value.len()) as u32,
            opaque: 0xdead_beef,
            cas,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.extend_from_slice(extras);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    fn set_extras(flags: u32, exptime: u32) -> Vec<u8> {
        let mut extras = flags.to_be_bytes().to_vec();
        extras.extend_from_slice(&exptime.to_be_bytes());
        extras
    }

    #[derive(Debug)]
    struct Response {
        header: Header,
        extras: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    }

    fn decode_all(mut data: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();
        while !data.is_empty() {
            let header = Header::decode(&data[..HEADER_LEN]);
            let extras_end = HEADER_LEN + header.extras_len as usize;
            let key_end = extras_end + header.key_len as usize;
            let end = HEADER_LEN + header.body_len as usize;
            responses.push(Response {
                header,
                extras: data[HEADER_LEN..extras_end].to_vec(),
                key: data[extras_end..key_end].to_vec(),
                value: data[key_end..end].to_vec(),
            });
            data = &data[end..];
        }
        responses
    }

    fn drive(protocol: &mut BinaryProtocol, con: &mut ConnectionState, input: &[u8]) -> Vec<Response> {
        con.input.extend_from_slice(input);
        while !con.input.is_empty() && !con.close_connection {
            con.reset_request_flags();
            con.write_checkpoint = con.output.checkpoint();
            match protocol.parse_request(con) {
                Ok(ParseOutcome::Complete) => {
                    if !con.noprocess {
                        if let Err(e) = protocol.process_request(con) {
                            escalate(protocol, con, e);
                        }
                    }
                }
                Ok(ParseOutcome::NeedMore(_)) => break,
                Err(e) => escalate(protocol, con, e),
            }
            let consumed = con.pending.min(con.input.len());
            con.input.advance(consumed);
            con.pending = PROBE_LEN;
        }
        let out: Vec<u8> = con
            .output
            .take_chunks()
            .iter()
            .flat_map(|c| c.to_vec())
            .collect();
        decode_all(&out)
    }

    fn exchange(input: &[u8]) -> Vec<Response> {
        let (mut protocol, mut con) = setup();
        drive(&mut protocol, &mut con, input)
    }

    #[test]
    fn test_header_layout() {
        let bytes = request(opcode::GET, &[], b"key", &[], 7);
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        let header = Header::decode(&bytes);
        assert_eq!(header.magic, 0x80);
        assert_eq!(header.key_len, 3);
        assert_eq!(header.body_len, 3);
        assert_eq!(header.opaque, 0xdead_beef);
        assert_eq!(header.cas, 7);
    }

    #[test]
    fn test_set_get() {
        let mut input = request(opcode::SET, &set_extras(42, 0), b"name", b"Ariz", 0);
        input.extend(request(opcode::GET, &[], b"name", &[], 0));

        let responses = exchange(&input);
        assert_eq!(responses.len(), 2);

        let set = &responses[0];
        assert_eq!(set.header.magic, BINARY_RESPONSE_MAGIC);
        assert_eq!(set.header.status, STATUS_OK);
        assert_eq!(set.header.opaque, 0xdead_beef);
        assert!(set.header.cas > 0);

        let get = &responses[1];
        assert_eq!(get.header.opcode, opcode::GET);
        assert_eq!(get.extras, 42u32.to_be_bytes());
        assert!(get.key.is_empty());
        assert_eq!(get.value, b"Ariz");
        assert_eq!(get.header.cas, set.header.cas);
    }

    #[test]
    fn test_get_miss_and_getk() {
        let mut input = request(opcode::GET, &[], b"missing", &[], 0);
        input.extend(request(opcode::SET, &set_extras(0, 0), b"k", b"v", 0));
        input.extend(request(opcode::GETK, &[], b"k", &[], 0));

        let responses = exchange(&input);
        assert_eq!(responses[0].header.status, ErrorKind::KeyNotFound.code());
        assert_eq!(responses[0].value, b"Not found");
        assert_eq!(responses[2].key, b"k");
    }

    #[test]
    fn test_quiet_commands() {
        let mut input = request(opcode::SETQ, &set_extras(0, 0), b"k", b"v", 0);
        input.extend(request(opcode::GETQ, &[], b"missing", &[], 0));
        input.extend(request(opcode::GETQ, &[], b"k", &[], 0));
        input.extend(request(opcode::NOOP, &[], &[], &[], 0));

        let responses = exchange(&input);
        let ops: Vec<u8> = responses.iter().map(|r| r.header.opcode).collect();
        assert_eq!(ops, vec![opcode::GETQ, opcode::NOOP]);
        assert_eq!(responses[0].value, b"v");
    }

    #[test]
    fn test_add_replace_status() {
        let mut input = request(opcode::ADD, &set_extras(0, 0), b"k", b"1", 0);
        input.extend(request(opcode::ADD, &set_extras(0, 0), b"k", b"2", 0));
        input.extend(request(opcode::REPLACE, &set_extras(0, 0), b"none", b"3", 0));

        let responses = exchange(&input);
        assert_eq!(responses[0].header.status, STATUS_OK);
        assert_eq!(responses[1].header.status, ErrorKind::KeyExists.code());
        assert_eq!(responses[2].header.status, ErrorKind::KeyNotFound.code());
    }

    #[test]
    fn test_set_with_cas() {
        let (mut protocol, mut con) = setup();
        let first = drive(
            &mut protocol,
            &mut con,
            &request(opcode::SET, &set_extras(0, 0), b"k", b"1", 0),
        );
        let cas = first[0].header.cas;

        let stale = drive(
            &mut protocol,
            &mut con,
            &request(opcode::SET, &set_extras(0, 0), b"k", b"2", cas + 1),
        );
        assert_eq!(stale[0].header.status, ErrorKind::KeyExists.code());

        let fresh = drive(
            &mut protocol,
            &mut con,
            &request(opcode::SET, &set_extras(0, 0), b"k", b"2", cas),
        );
        assert_eq!(fresh[0].header.status, STATUS_OK);
    }

    #[test]
    fn test_incr_with_initial_and_no_create() {
        let mut extras = 5u64.to_be_bytes().to_vec();
        extras.extend_from_slice(&100u64.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        let mut input = request(opcode::INCREMENT, &extras, b"n", &[], 0);
        input.extend(request(opcode::INCREMENT, &extras, b"n", &[], 0));

        let mut no_create = 1u64.to_be_bytes().to_vec();
        no_create.extend_from_slice(&0u64.to_be_bytes());
        no_create.extend_from_slice(&NO_AUTO_CREATE.to_be_bytes());
        input.extend(request(opcode::DECREMENT, &no_create, b"other", &[], 0));

        let responses = exchange(&input);
        assert_eq!(responses[0].value, 100u64.to_be_bytes());
        assert_eq!(responses[1].value, 105u64.to_be_bytes());
        assert_eq!(responses[2].header.status, ErrorKind::KeyNotFound.code());
    }

    #[test]
    fn test_unknown_opcode_is_recoverable() {
        let mut input = request(0x7f, &[], &[], b"junk", 0);
        input.extend(request(opcode::NOOP, &[], &[], &[], 0));

        let responses = exchange(&input);
        assert_eq!(responses[0].header.status, ErrorKind::UnknownCommand.code());
        assert_eq!(responses[0].header.opcode, 0x7f);
        assert_eq!(responses[1].header.opcode, opcode::NOOP);
    }

    #[test]
    fn test_bad_extras_is_invalid_arguments() {
        let responses = exchange(&request(opcode::SET, &[], b"k", b"v", 0));
        assert_eq!(responses[0].header.status, ErrorKind::InvalidArguments.code());
    }

    #[test]
    fn test_bad_magic_closes() {
        let (mut protocol, mut con) = setup();
        con.input.extend_from_slice(&[0x42; HEADER_LEN + 4]);
        assert!(protocol.parse_request(&mut con).is_err());
        assert!(con.close_connection);
        assert_eq!(con.pending, HEADER_LEN + 4);
    }

    #[test]
    fn test_need_more() {
        let (mut protocol, mut con) = setup();
        let packet = request(opcode::SET, &set_extras(0, 0), b"k", b"value", 0);

        con.input.extend_from_slice(&packet[..10]);
        assert_eq!(
            protocol.parse_request(&mut con).unwrap(),
            ParseOutcome::NeedMore(HEADER_LEN)
        );

        con.input.extend_from_slice(&packet[10..30]);
        assert_eq!(
            protocol.parse_request(&mut con).unwrap(),
            ParseOutcome::NeedMore(packet.len())
        );
    }

    #[test]
    fn test_oversized_body_is_drained() {
        let (mut protocol, mut con) = setup();
        let mut header = Header::decode(&request(opcode::SET, &set_extras(0, 0), b"k", &[], 0));
        header.body_len = (MAX_BODY_LEN + 1) as u32;
        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        con.input.extend_from_slice(&bytes);

        assert_eq!(
            protocol.parse_request(&mut con).unwrap(),
            ParseOutcome::Complete
        );
        assert!(con.noprocess);
        assert_eq!(con.pending, HEADER_LEN + MAX_BODY_LEN + 1);
        assert!(!con.output.is_empty());
    }

    #[test]
    fn test_delete_touch_flush_version() {
        let mut input = request(opcode::SET, &set_extras(0, 0), b"k", b"v", 0);
        input.extend(request(opcode::TOUCH, &60u32.to_be_bytes(), b"k", &[], 0));
        input.extend(request(opcode::DELETE, &[], b"k", &[], 0));
        input.extend(request(opcode::DELETE, &[], b"k", &[], 0));
        input.extend(request(opcode::FLUSH, &[], &[], &[], 0));
        input.extend(request(opcode::VERSION, &[], &[], &[], 0));

        let responses = exchange(&input);
        let statuses: Vec<u16> = responses.iter().map(|r| r.header.status).collect();
        assert_eq!(
            statuses,
            vec![0, 0, 0, ErrorKind::KeyNotFound.code(), 0, 0]
        );
        assert_eq!(responses[5].value, crate::VERSION.as_bytes());
    }

    #[test]
    fn test_stat_ends_with_empty_packet() {
        let responses = exchange(&request(opcode::STAT, &[], &[], &[], 0));
        let last = responses.last().unwrap();
        assert!(last.key.is_empty() && last.value.is_empty());
        assert!(responses.iter().any(|r| r.key == b"curr_items"));
    }

    #[test]
    fn test_quit_closes() {
        let (mut protocol, mut con) = setup();
        let responses = drive(&mut protocol, &mut con, &request(opcode::QUIT, &[], &[], &[], 0));
        assert_eq!(responses.len(), 1);
        assert!(con.close_connection);
    }
}
