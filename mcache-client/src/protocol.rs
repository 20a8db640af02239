//! # Text Protocol Encoding and Parsing
//!
//! Purpose: Encode memcached text commands and parse server replies,
//! keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Each call reads exactly one reply item.
//! 2. **Buffer Reuse**: Caller provides the line and write buffers.
//! 3. **Binary-Safe**: Data blocks are read by their declared length, so
//!    payload bytes are never interpreted.
//! 4. **Fail Fast**: Invalid framing returns `WireError::Malformed`.

use std::io::{self, BufRead, Read};

use bytes::Bytes;

/// Largest data block accepted in a `VALUE` reply (memcached's item size cap).
pub(crate) const MAX_VALUE_LEN: usize = 1024 * 1024 * 1024;

/// Failure while talking to one server, before status translation.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed reply: {0}")]
    Malformed(&'static str),
}

pub(crate) type WireResult<T> = Result<T, WireError>;

/// Storage command verbs sharing the `<key> <flags> <exptime> <bytes>` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StorageVerb {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            StorageVerb::Set => b"set",
            StorageVerb::Add => b"add",
            StorageVerb::Replace => b"replace",
            StorageVerb::Append => b"append",
            StorageVerb::Prepend => b"prepend",
        }
    }
}

/// One value block from a `get` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValueBlock {
    pub key: String,
    pub flags: u32,
    pub data: Bytes,
}

/// A single reply item read from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    End,
    Value(ValueBlock),
    Number(u64),
    Stat { name: String, value: String },
    Error,
    ClientError(String),
    ServerError(String),
}

/// Encodes `<verb> <key> <flags> <exptime> <bytes> [noreply]\r\n<data>\r\n`.
pub(crate) fn encode_storage(
    verb: StorageVerb,
    key: &str,
    flags: u32,
    exptime: u32,
    data: &[u8],
    noreply: bool,
    out: &mut Vec<u8>,
) {
    out.extend_from_slice(verb.as_bytes());
    out.push(b' ');
    out.extend_from_slice(key.as_bytes());
    out.push(b' ');
    push_u64(out, flags as u64);
    out.push(b' ');
    push_u64(out, exptime as u64);
    out.push(b' ');
    push_u64(out, data.len() as u64);
    if noreply {
        out.extend_from_slice(b" noreply");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Encodes `get <key>*\r\n`.
pub(crate) fn encode_get<K: AsRef<str>>(keys: &[K], out: &mut Vec<u8>) {
    out.extend_from_slice(b"get");
    for key in keys {
        out.push(b' ');
        out.extend_from_slice(key.as_ref().as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

/// Encodes `delete <key> [noreply]\r\n`.
pub(crate) fn encode_delete(key: &str, noreply: bool, out: &mut Vec<u8>) {
    out.extend_from_slice(b"delete ");
    out.extend_from_slice(key.as_bytes());
    if noreply {
        out.extend_from_slice(b" noreply");
    }
    out.extend_from_slice(b"\r\n");
}

/// Encodes `incr|decr <key> <delta>\r\n`.
pub(crate) fn encode_arith(increment: bool, key: &str, delta: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(if increment { b"incr " } else { b"decr " });
    out.extend_from_slice(key.as_bytes());
    out.push(b' ');
    push_u64(out, delta);
    out.extend_from_slice(b"\r\n");
}

/// Encodes `stats\r\n`.
pub(crate) fn encode_stats(out: &mut Vec<u8>) {
    out.extend_from_slice(b"stats\r\n");
}

/// Reads one reply item, including the data block of a `VALUE` line.
pub(crate) fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> WireResult<Reply> {
    read_line(reader, line_buf)?;
    let line = line_buf.as_slice();

    match line {
        b"STORED" => return Ok(Reply::Stored),
        b"NOT_STORED" => return Ok(Reply::NotStored),
        b"EXISTS" => return Ok(Reply::Exists),
        b"NOT_FOUND" => return Ok(Reply::NotFound),
        b"DELETED" => return Ok(Reply::Deleted),
        b"END" => return Ok(Reply::End),
        b"ERROR" => return Ok(Reply::Error),
        _ => {}
    }

    if let Some(rest) = line.strip_prefix(b"VALUE ") {
        let (key, flags, len) = parse_value_header(rest)?;
        return read_value_block(reader, key, flags, len);
    }
    if let Some(rest) = line.strip_prefix(b"STAT ") {
        let text = String::from_utf8_lossy(rest);
        let (name, value) = text.split_once(' ').unwrap_or((text.as_ref(), ""));
        return Ok(Reply::Stat {
            name: name.to_owned(),
            value: value.to_owned(),
        });
    }
    if let Some(rest) = line.strip_prefix(b"CLIENT_ERROR") {
        return Ok(Reply::ClientError(message(rest)));
    }
    if let Some(rest) = line.strip_prefix(b"SERVER_ERROR") {
        return Ok(Reply::ServerError(message(rest)));
    }
    if line.first().is_some_and(|b| b.is_ascii_digit()) {
        return Ok(Reply::Number(parse_u64(trim_end_spaces(line))?));
    }

    Err(WireError::Malformed("unrecognized reply line"))
}

fn parse_value_header(rest: &[u8]) -> WireResult<(String, u32, usize)> {
    let mut fields = rest.split(|&b| b == b' ').filter(|f| !f.is_empty());
    let key = fields.next().ok_or(WireError::Malformed("VALUE without key"))?;
    let flags = fields.next().ok_or(WireError::Malformed("VALUE without flags"))?;
    let len = fields.next().ok_or(WireError::Malformed("VALUE without length"))?;

    let flags = u32::try_from(parse_u64(flags)?).map_err(|_| WireError::Malformed("flags overflow"))?;
    let len = usize::try_from(parse_u64(len)?).map_err(|_| WireError::Malformed("length overflow"))?;
    if len > MAX_VALUE_LEN {
        return Err(WireError::Malformed("VALUE length exceeds item size limit"));
    }
    Ok((String::from_utf8_lossy(key).into_owned(), flags, len))
}

fn read_value_block<R: BufRead>(reader: &mut R, key: String, flags: u32, len: usize) -> WireResult<Reply> {
    // Grow with the bytes actually received instead of trusting `len` up front.
    let mut data = Vec::with_capacity(len.min(64 * 1024));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(WireError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside a data block",
        )));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(WireError::Malformed("data block not terminated by CRLF"));
    }

    Ok(Reply::Value(ValueBlock {
        key,
        flags,
        data: Bytes::from(data),
    }))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> WireResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(WireError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        )));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(WireError::Malformed("line not terminated by CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn message(rest: &[u8]) -> String {
    String::from_utf8_lossy(rest).trim().to_owned()
}

fn trim_end_spaces(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    &data[..end]
}

fn parse_u64(data: &[u8]) -> WireResult<u64> {
    if data.is_empty() {
        return Err(WireError::Malformed("empty number"));
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(WireError::Malformed("invalid number"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or(WireError::Malformed("number overflow"))?;
    }
    Ok(value)
}

fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(input: &[u8]) -> WireResult<Reply> {
        let mut reader = Cursor::new(input.to_vec());
        let mut line = Vec::new();
        read_reply(&mut reader, &mut line)
    }

    #[test]
    fn encodes_storage_command() {
        let mut buf = Vec::new();
        encode_storage(StorageVerb::Set, "key", 1, 0, b"hello", false, &mut buf);
        assert_eq!(&buf, b"set key 1 0 5\r\nhello\r\n");

        buf.clear();
        encode_storage(StorageVerb::Prepend, "key", 0, 30, b"", true, &mut buf);
        assert_eq!(&buf, b"prepend key 0 30 0 noreply\r\n\r\n");
    }

    #[test]
    fn storage_length_counts_zero_bytes() {
        let mut buf = Vec::new();
        encode_storage(StorageVerb::Add, "k", 0, 0, b"a\0b\0", false, &mut buf);
        assert_eq!(&buf, b"add k 0 0 4\r\na\0b\0\r\n");
    }

    #[test]
    fn encodes_other_commands() {
        let mut buf = Vec::new();
        encode_get(&["a", "b"], &mut buf);
        assert_eq!(&buf, b"get a b\r\n");

        buf.clear();
        encode_delete("a", true, &mut buf);
        assert_eq!(&buf, b"delete a noreply\r\n");

        buf.clear();
        encode_arith(false, "n", 7, &mut buf);
        assert_eq!(&buf, b"decr n 7\r\n");

        buf.clear();
        encode_stats(&mut buf);
        assert_eq!(&buf, b"stats\r\n");
    }

    #[test]
    fn parses_status_lines() {
        assert_eq!(parse(b"STORED\r\n").unwrap(), Reply::Stored);
        assert_eq!(parse(b"NOT_STORED\r\n").unwrap(), Reply::NotStored);
        assert_eq!(parse(b"NOT_FOUND\r\n").unwrap(), Reply::NotFound);
        assert_eq!(parse(b"DELETED\r\n").unwrap(), Reply::Deleted);
        assert_eq!(parse(b"END\r\n").unwrap(), Reply::End);
        assert_eq!(parse(b"ERROR\r\n").unwrap(), Reply::Error);
    }

    #[test]
    fn parses_error_lines() {
        assert_eq!(
            parse(b"SERVER_ERROR object too large for cache\r\n").unwrap(),
            Reply::ServerError("object too large for cache".to_string())
        );
        assert_eq!(
            parse(b"CLIENT_ERROR bad data chunk\r\n").unwrap(),
            Reply::ClientError("bad data chunk".to_string())
        );
    }

    #[test]
    fn parses_value_block_with_embedded_terminators() {
        let reply = parse(b"VALUE k 1 6\r\na\0\r\nb\0\r\n").unwrap();
        match reply {
            Reply::Value(block) => {
                assert_eq!(block.key, "k");
                assert_eq!(block.flags, 1);
                assert_eq!(block.data.as_ref(), b"a\0\r\nb\0");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn parses_value_with_cas_field() {
        let reply = parse(b"VALUE k 0 2 99\r\nhi\r\n").unwrap();
        assert!(matches!(reply, Reply::Value(block) if block.data.as_ref() == b"hi"));
    }

    #[test]
    fn parses_numbers_and_stats() {
        assert_eq!(parse(b"16\r\n").unwrap(), Reply::Number(16));
        assert_eq!(parse(b"9  \r\n").unwrap(), Reply::Number(9));
        assert_eq!(
            parse(b"STAT version 1.6.21\r\n").unwrap(),
            Reply::Stat {
                name: "version".to_string(),
                value: "1.6.21".to_string()
            }
        );
    }

    #[test]
    fn rejects_bad_framing() {
        assert!(matches!(parse(b"STORED\n"), Err(WireError::Malformed(_))));
        assert!(matches!(parse(b"WAT\r\n"), Err(WireError::Malformed(_))));
        assert!(matches!(parse(b"VALUE k 0 5\r\nhi\r\n"), Err(WireError::Io(_))));
        assert!(matches!(parse(b"VALUE k 0 2\r\nhiXX"), Err(WireError::Malformed(_))));
        assert!(matches!(parse(b""), Err(WireError::Io(_))));
    }

    #[test]
    fn rejects_value_lengths_beyond_item_limit() {
        let reply = parse(b"VALUE k 0 18446744073709551615\r\n");
        assert!(matches!(reply, Err(WireError::Malformed(_))));

        let header = format!("VALUE k 0 {}\r\n", MAX_VALUE_LEN + 1);
        assert!(matches!(parse(header.as_bytes()), Err(WireError::Malformed(_))));

        // A length at the limit is accepted and then starved of data.
        let header = format!("VALUE k 0 {MAX_VALUE_LEN}\r\nshort\r\n");
        assert!(matches!(parse(header.as_bytes()), Err(WireError::Io(_))));
    }
}
