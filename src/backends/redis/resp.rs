/// RESP (Redis Serialization Protocol) framing for the cache client
use crate::error::CacheError;
use bytes::{BufMut, Bytes, BytesMut};
use std::str;

/// A decoded RESP frame
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// `+OK\r\n`
    SimpleString(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:123\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`; `None` is the null bulk string
    BulkString(Option<Bytes>),
    /// `*2\r\n...`; `None` is the null array
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(Some(data)) => Some(data.as_ref()),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it used, or `None` when
/// `buf` does not yet hold a complete frame. Nothing is consumed, so the
/// caller can append more bytes and try again.
pub fn parse(buf: &[u8]) -> Result<Option<(RespValue, usize)>, CacheError> {
    let Some(&kind) = buf.first() else {
        return Ok(None);
    };
    let Some((line, mut used)) = read_line(buf) else {
        return Ok(None);
    };
    let body = line.get(1..).unwrap_or(&[]);

    let value = match kind {
        b'+' => RespValue::SimpleString(utf8(body)?.to_string()),
        b'-' => RespValue::Error(utf8(body)?.to_string()),
        b':' => RespValue::Integer(integer(body)?),
        b'$' => {
            let size = integer(body)?;
            if size < 0 {
                return Ok(Some((RespValue::BulkString(None), used)));
            }
            let size = size as usize;
            if buf.len() < used + size + 2 {
                return Ok(None);
            }
            if &buf[used + size..used + size + 2] != b"\r\n" {
                return Err(CacheError::protocol("missing CRLF after bulk string"));
            }
            let data = Bytes::copy_from_slice(&buf[used..used + size]);
            used += size + 2;
            RespValue::BulkString(Some(data))
        }
        b'*' => {
            let count = integer(body)?;
            if count < 0 {
                return Ok(Some((RespValue::Array(None), used)));
            }
            let mut elements = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match parse(&buf[used..])? {
                    Some((element, n)) => {
                        elements.push(element);
                        used += n;
                    }
                    None => return Ok(None),
                }
            }
            RespValue::Array(Some(elements))
        }
        other => {
            return Err(CacheError::protocol(format!(
                "unknown RESP type byte {:?}",
                other as char
            )))
        }
    };
    Ok(Some((value, used)))
}

/// The line up to CRLF (exclusive) and the bytes used including CRLF
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    buf.windows(2)
        .position(|w| w == b"\r\n")
        .map(|end| (&buf[..end], end + 2))
}

fn utf8(data: &[u8]) -> Result<&str, CacheError> {
    str::from_utf8(data).map_err(|e| CacheError::protocol(e.to_string()))
}

fn integer(data: &[u8]) -> Result<i64, CacheError> {
    btoi::btoi::<i64>(data).map_err(|_| {
        CacheError::protocol(format!(
            "invalid integer {:?}",
            String::from_utf8_lossy(data)
        ))
    })
}

/// Encode a command as an array of bulk strings
pub fn encode_command(args: &[&[u8]], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        buf.put_u8(b'$');
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Encode a reply frame
pub fn encode_value(value: &RespValue, buf: &mut BytesMut) {
    match value {
        RespValue::SimpleString(s) => {
            buf.put_u8(b'+');
            buf.extend_from_slice(s.as_bytes());
            buf.put_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            buf.put_u8(b'-');
            buf.extend_from_slice(s.as_bytes());
            buf.put_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            buf.put_u8(b':');
            buf.extend_from_slice(n.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        RespValue::BulkString(Some(data)) => {
            buf.put_u8(b'$');
            buf.extend_from_slice(data.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.extend_from_slice(data);
            buf.put_slice(b"\r\n");
        }
        RespValue::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(Some(elements)) => {
            buf.put_u8(b'*');
            buf.extend_from_slice(elements.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            for element in elements {
                encode_value(element, buf);
            }
        }
        RespValue::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str) -> (RespValue, usize) {
        parse(input.as_bytes()).unwrap().unwrap()
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(
            parse_all("+OK\r\n"),
            (RespValue::SimpleString("OK".to_string()), 5)
        );
        assert_eq!(
            parse_all("-ERR unknown command\r\n").0,
            RespValue::Error("ERR unknown command".to_string())
        );
        assert_eq!(parse_all(":1000\r\n").0, RespValue::Integer(1000));
        assert_eq!(parse_all("$-1\r\n").0, RespValue::BulkString(None));
    }

    #[test]
    fn test_parse_scan_reply() {
        let input = "*2\r\n$1\r\n0\r\n*2\r\n$6\r\nq:a:01\r\n$6\r\nq:b:02\r\n";
        let (value, used) = parse_all(input);
        assert_eq!(used, input.len());

        let RespValue::Array(Some(parts)) = value else {
            panic!("expected array");
        };
        assert_eq!(parts[0].as_bytes(), Some(&b"0"[..]));
        assert_eq!(
            parts[1],
            RespValue::Array(Some(vec![
                RespValue::BulkString(Some(Bytes::from("q:a:01"))),
                RespValue::BulkString(Some(Bytes::from("q:b:02"))),
            ]))
        );
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        assert!(parse(b"+OK\r").unwrap().is_none());
        assert!(parse(b"$5\r\nhel").unwrap().is_none());
        assert!(parse(b"*2\r\n$5\r\nhello\r\n").unwrap().is_none());
    }

    #[test]
    fn test_trailing_bytes_are_left() {
        let (value, used) = parse(b":1\r\n:2\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Integer(1));
        assert_eq!(used, 4);
    }

    #[test]
    fn test_invalid_frames() {
        assert!(parse(b"?what\r\n").is_err());
        assert!(parse(b":12x\r\n").is_err());
        assert!(parse(b"$2\r\nhiXX").is_err());
    }

    #[test]
    fn test_encode_command() {
        let mut buf = BytesMut::new();
        encode_command(&[b"SET".as_slice(), b"key".as_slice(), b"value".as_slice()], &mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
    }
}
