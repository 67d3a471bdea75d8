//! memcached Text Protocol
//!
//! Line-oriented requests terminated by `\r\n` (a bare `\n` is accepted too).
//! Storage commands are followed by a data block of the declared length plus
//! its own `\r\n`:
//!
//! ```text
//! set <key> <flags> <exptime> <bytes> [noreply]\r\n
//! <data block>\r\n
//! ```
//!
//! ## Framing
//!
//! - No newline yet: ask for one more byte than is buffered.
//! - No newline within [`MAX_LINE_LENGTH`] bytes: the stream cannot be
//!   resynchronised, so the connection is closed.
//! - A storage command's request length is `line + bytes + 2`; a data block
//!   over [`MAX_VALUE_SIZE`] is drained without being stored.

use crate::commands::{ArithOp, CommandHandler, StoreMode, MAX_VALUE_SIZE};
use crate::connection::ConnectionState;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::protocol::{ParseOutcome, Protocol};
use crate::storage::Record;
use bytes::Bytes;
use std::str::FromStr;

/// Longest command line accepted, in bytes.
pub const MAX_LINE_LENGTH: usize = 2048;

const CRLF: &[u8] = b"\r\n";

/// A framed text request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TextRequest {
    Get {
        keys: Vec<Bytes>,
        with_cas: bool,
    },
    Gat {
        exptime: i64,
        keys: Vec<Bytes>,
        with_cas: bool,
    },
    Store {
        mode: StoreMode,
        key: Bytes,
        flags: u32,
        exptime: i64,
        value: Bytes,
    },
    Delete {
        key: Bytes,
    },
    Arith {
        op: ArithOp,
        key: Bytes,
        delta: u64,
    },
    Touch {
        key: Bytes,
        exptime: i64,
    },
    FlushAll {
        delay: i64,
    },
    Verbosity {
        level: u32,
    },
    Version,
    Stats,
    Quit,
}

/// The memcached text protocol.
pub struct TextProtocol {
    commands: CommandHandler,
    request: Option<TextRequest>,
}

impl TextProtocol {
    pub fn new(commands: CommandHandler) -> Self {
        Self {
            commands,
            request: None,
        }
    }

    fn parse_line(
        &mut self,
        con: &mut ConnectionState,
        line: &Bytes,
        line_len: usize,
    ) -> StoreResult<ParseOutcome> {
        let mut tokens: Vec<&[u8]> = line
            .split(|&b| b == b' ')
            .filter(|token| !token.is_empty())
            .collect();
        let Some(&command) = tokens.first() else {
            return Err(StoreError::kind(ErrorKind::UnknownCommand));
        };
        let key = |token: &[u8]| line.slice_ref(token);

        let request = match command {
            b"get" | b"gets" => {
                if tokens.len() < 2 {
                    return Err(StoreError::kind(ErrorKind::UnknownCommand));
                }
                TextRequest::Get {
                    keys: tokens[1..].iter().map(|t| key(*t)).collect(),
                    with_cas: command == b"gets",
                }
            }
            b"gat" | b"gats" => {
                if tokens.len() < 3 {
                    return Err(StoreError::kind(ErrorKind::UnknownCommand));
                }
                TextRequest::Gat {
                    exptime: number(tokens[1])?,
                    keys: tokens[2..].iter().map(|t| key(*t)).collect(),
                    with_cas: command == b"gats",
                }
            }
            b"set" | b"add" | b"replace" | b"append" | b"prepend" | b"cas" => {
                take_noreply(con, &mut tokens);
                return self.parse_storage(con, command, &tokens, line, line_len);
            }
            b"delete" => {
                take_noreply(con, &mut tokens);
                match tokens.len() {
                    2 => {}
                    3 if tokens[2] == b"0" => {}
                    _ => {
                        return Err(StoreError::protocol(
                            ErrorKind::InvalidArguments,
                            "bad command line format.  Usage: delete <key> [noreply]",
                        ))
                    }
                }
                TextRequest::Delete { key: key(tokens[1]) }
            }
            b"incr" | b"decr" => {
                take_noreply(con, &mut tokens);
                expect_args(&tokens, 3)?;
                let delta = std::str::from_utf8(tokens[2])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        StoreError::protocol(
                            ErrorKind::InvalidArguments,
                            "invalid numeric delta argument",
                        )
                    })?;
                TextRequest::Arith {
                    op: if command == b"incr" {
                        ArithOp::Incr
                    } else {
                        ArithOp::Decr
                    },
                    key: key(tokens[1]),
                    delta,
                }
            }
            b"touch" => {
                take_noreply(con, &mut tokens);
                expect_args(&tokens, 3)?;
                TextRequest::Touch {
                    key: key(tokens[1]),
                    exptime: number(tokens[2])?,
                }
            }
            b"flush_all" => {
                take_noreply(con, &mut tokens);
                let delay = match tokens.len() {
                    1 => 0,
                    2 => number(tokens[1])?,
                    _ => return Err(StoreError::kind(ErrorKind::InvalidArguments)),
                };
                TextRequest::FlushAll { delay }
            }
            b"verbosity" => {
                take_noreply(con, &mut tokens);
                expect_args(&tokens, 2)?;
                TextRequest::Verbosity {
                    level: number(tokens[1])?,
                }
            }
            b"version" => TextRequest::Version,
            b"stats" => TextRequest::Stats,
            b"quit" => TextRequest::Quit,
            _ => return Err(StoreError::kind(ErrorKind::UnknownCommand)),
        };

        self.request = Some(request);
        Ok(ParseOutcome::Complete)
    }

    fn parse_storage(
        &mut self,
        con: &mut ConnectionState,
        command: &[u8],
        tokens: &[&[u8]],
        line: &Bytes,
        line_len: usize,
    ) -> StoreResult<ParseOutcome> {
        let is_cas = command == b"cas";
        expect_args(tokens, if is_cas { 6 } else { 5 })?;

        let bytes: usize = number(tokens[4])?;
        let total = line_len
            .checked_add(bytes)
            .and_then(|n| n.checked_add(CRLF.len()))
            .ok_or_else(|| StoreError::kind(ErrorKind::InvalidArguments))?;

        if bytes > MAX_VALUE_SIZE {
            con.pending = total;
            con.noprocess = true;
            con.output
                .put_slice(b"SERVER_ERROR object too large for cache\r\n");
            return Ok(ParseOutcome::Complete);
        }
        if con.input.len() < total {
            return Ok(ParseOutcome::NeedMore(total));
        }

        // From here on the data block is consumed whatever happens.
        con.pending = total;
        if &con.input[total - CRLF.len()..total] != CRLF {
            return Err(StoreError::protocol(
                ErrorKind::InvalidArguments,
                "bad data chunk",
            ));
        }

        let mode = match command {
            b"set" => StoreMode::Set,
            b"add" => StoreMode::Add,
            b"replace" => StoreMode::Replace,
            b"append" => StoreMode::Append,
            b"prepend" => StoreMode::Prepend,
            _ => StoreMode::Cas(number(tokens[5])?),
        };

        self.request = Some(TextRequest::Store {
            mode,
            key: line.slice_ref(tokens[1]),
            flags: number(tokens[2])?,
            exptime: number(tokens[3])?,
            value: Bytes::copy_from_slice(&con.input[line_len..line_len + bytes]),
        });
        Ok(ParseOutcome::Complete)
    }
}

impl Protocol for TextProtocol {
    fn name(&self) -> &'static str {
        "text"
    }

    fn parse_request(&mut self, con: &mut ConnectionState) -> StoreResult<ParseOutcome> {
        self.request = None;

        let Some(newline) = con.input.iter().position(|&b| b == b'\n') else {
            if con.input.len() > MAX_LINE_LENGTH {
                con.pending = con.input.len();
                con.close_connection = true;
                return Err(StoreError::protocol(
                    ErrorKind::InvalidArguments,
                    "line too long",
                ));
            }
            return Ok(ParseOutcome::NeedMore(con.input.len() + 1));
        };

        let line_len = newline + 1;
        con.pending = line_len;
        if newline > MAX_LINE_LENGTH {
            return Err(StoreError::protocol(
                ErrorKind::InvalidArguments,
                "line too long",
            ));
        }

        let mut line = &con.input[..newline];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let line = Bytes::copy_from_slice(line);
        self.parse_line(con, &line, line_len)
    }

    fn process_request(&mut self, con: &mut ConnectionState) -> StoreResult<()> {
        let Some(request) = self.request.take() else {
            return Ok(());
        };

        match request {
            TextRequest::Get { keys, with_cas } => {
                for key in keys {
                    if let Some(record) = self.commands.get(&key)? {
                        write_value(con, &record, with_cas);
                    }
                }
                con.output.put_slice(b"END\r\n");
            }
            TextRequest::Gat {
                exptime,
                keys,
                with_cas,
            } => {
                for key in keys {
                    if let Some(record) = self.commands.get_and_touch(&key, exptime)? {
                        write_value(con, &record, with_cas);
                    }
                }
                con.output.put_slice(b"END\r\n");
            }
            TextRequest::Store {
                mode,
                key,
                flags,
                exptime,
                value,
            } => {
                self.commands.store(mode, key, value, flags, exptime)?;
                reply(con, b"STORED\r\n");
            }
            TextRequest::Delete { key } => {
                self.commands.delete(&key)?;
                reply(con, b"DELETED\r\n");
            }
            TextRequest::Arith { op, key, delta } => {
                let (value, _) = self.commands.arith(op, key, delta, None)?;
                reply(con, format!("{}\r\n", value).as_bytes());
            }
            TextRequest::Touch { key, exptime } => {
                self.commands.touch(&key, exptime)?;
                reply(con, b"TOUCHED\r\n");
            }
            TextRequest::FlushAll { delay } => {
                self.commands.flush_all(delay)?;
                reply(con, b"OK\r\n");
            }
            TextRequest::Verbosity { level } => {
                self.commands.verbosity(level);
                reply(con, b"OK\r\n");
            }
            TextRequest::Version => {
                let line = format!("VERSION {}\r\n", self.commands.version());
                con.output.put_slice(line.as_bytes());
            }
            TextRequest::Stats => {
                for (name, value) in self.commands.stats()? {
                    let line = format!("STAT {} {}\r\n", name, value);
                    con.output.put_slice(line.as_bytes());
                }
                con.output.put_slice(b"END\r\n");
            }
            TextRequest::Quit => con.close_connection = true,
        }
        Ok(())
    }

    fn process_error(&mut self, con: &mut ConnectionState, kind: ErrorKind, message: &str) {
        let line = match kind {
            ErrorKind::KeyNotFound | ErrorKind::KeyExists | ErrorKind::NotStored
                if con.noreply =>
            {
                return
            }
            ErrorKind::KeyNotFound => "NOT_FOUND\r\n".to_string(),
            ErrorKind::KeyExists => "EXISTS\r\n".to_string(),
            ErrorKind::NotStored => "NOT_STORED\r\n".to_string(),
            ErrorKind::UnknownCommand => "ERROR\r\n".to_string(),
            ErrorKind::InvalidArguments | ErrorKind::DeltaBadValue => {
                format!("CLIENT_ERROR {}\r\n", message)
            }
            _ => format!("SERVER_ERROR {}\r\n", message),
        };
        con.output.put_slice(line.as_bytes());
    }
}

fn number<T: FromStr>(token: &[u8]) -> StoreResult<T> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::kind(ErrorKind::InvalidArguments))
}

fn expect_args(tokens: &[&[u8]], count: usize) -> StoreResult<()> {
    if tokens.len() == count {
        Ok(())
    } else {
        Err(StoreError::kind(ErrorKind::InvalidArguments))
    }
}

fn take_noreply(con: &mut ConnectionState, tokens: &mut Vec<&[u8]>) {
    if tokens.len() > 1 && tokens.last() == Some(&&b"noreply"[..]) {
        tokens.pop();
        con.noreply = true;
    }
}

fn reply(con: &mut ConnectionState, line: &[u8]) {
    if !con.noreply {
        con.output.put_slice(line);
    }
}

fn write_value(con: &mut ConnectionState, record: &Record, with_cas: bool) {
    con.output.put_slice(b"VALUE ");
    con.output.put_slice(&record.key);
    let header = if with_cas {
        format!(" {} {} {}\r\n", record.flags, record.value.len(), record.cas)
    } else {
        format!(" {} {}\r\n", record.flags, record.value.len())
    };
    con.output.put_slice(header.as_bytes());
    con.output.put_bytes(record.value.clone());
    con.output.put_slice(CRLF);
}
