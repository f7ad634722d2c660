/// Redis RESP (Redis Serialization Protocol) parsing and generation

use bytes::{BufMut, Bytes, BytesMut};
use std::str;

use crate::core::command::Command;
use crate::error::{ShardisError, ShardisResult};

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

/// Largest bulk string or array the server may announce (`proto-max-bulk-len`)
pub const MAX_FRAME_LEN: i64 = 512 * 1024 * 1024;

/// RESP parser for reading Redis protocol messages
pub struct RespParser;

/// RESP encoder for writing Redis protocol messages
pub struct RespEncoder;

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(#[from] btoi::ParseIntegerError),
}

impl RespValue {
    /// Bulk string from any byte-like value
    pub fn bulk<B: AsRef<[u8]>>(data: B) -> Self {
        RespValue::BulkString(Some(Bytes::copy_from_slice(data.as_ref())))
    }

    /// Turn a server error reply into a data-level error
    pub fn into_result(self) -> ShardisResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(ShardisError::data(message)),
            other => Ok(other),
        }
    }

    /// Textual view of simple and bulk strings
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s.as_str()),
            RespValue::BulkString(Some(data)) => str::from_utf8(data).ok(),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }
}

impl RespParser {
    /// Parse one RESP value from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything when the buffer does not
    /// yet hold a complete frame, so callers can append more bytes and retry.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match Self::decode(buf, 0)? {
            Some((value, end)) => {
                let _ = buf.split_to(end);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse every complete value currently buffered
    pub fn parse_all(buf: &mut BytesMut) -> Result<Vec<RespValue>, RespParseError> {
        let mut values = Vec::new();
        while let Some(value) = Self::parse(buf)? {
            values.push(value);
        }
        Ok(values)
    }

    fn decode(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let (line, next) = match Self::read_line(buf, pos) {
            Some(found) => found,
            None => return Ok(None),
        };
        if line.is_empty() {
            return Err(RespParseError::InvalidFormat("empty frame header".to_string()));
        }

        let body = &line[1..];
        match line[0] {
            b'+' => Ok(Some((RespValue::SimpleString(str::from_utf8(body)?.to_string()), next))),
            b'-' => Ok(Some((RespValue::Error(str::from_utf8(body)?.to_string()), next))),
            b':' => Ok(Some((RespValue::Integer(btoi::btoi(body)?), next))),
            b'$' => Self::decode_bulk(buf, body, next),
            b'*' => Self::decode_array(buf, body, next),
            other => Err(RespParseError::InvalidFormat(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }

    fn decode_bulk(
        buf: &[u8],
        header: &[u8],
        next: usize,
    ) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let size: i64 = btoi::btoi(header)?;
        if size == -1 {
            return Ok(Some((RespValue::BulkString(None), next)));
        }
        if !(0..=MAX_FRAME_LEN).contains(&size) {
            return Err(RespParseError::InvalidFormat(format!(
                "Invalid bulk string size: {}",
                size
            )));
        }

        let end = next + size as usize;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(RespParseError::InvalidFormat(
                "Missing \\r\\n after bulk string".to_string(),
            ));
        }

        let content = Bytes::copy_from_slice(&buf[next..end]);
        Ok(Some((RespValue::BulkString(Some(content)), end + 2)))
    }

    fn decode_array(
        buf: &[u8],
        header: &[u8],
        next: usize,
    ) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let size: i64 = btoi::btoi(header)?;
        if size == -1 {
            return Ok(Some((RespValue::Array(None), next)));
        }
        if !(0..=MAX_FRAME_LEN).contains(&size) {
            return Err(RespParseError::InvalidFormat(format!(
                "Invalid array size: {}",
                size
            )));
        }

        let mut elements = Vec::with_capacity((size as usize).min(1024));
        let mut pos = next;
        for _ in 0..size {
            match Self::decode(buf, pos)? {
                Some((element, end)) => {
                    elements.push(element);
                    pos = end;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((RespValue::Array(Some(elements)), pos)))
    }

    /// Find the line starting at `pos`; returns its content and the offset after \r\n
    fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
        let rest = buf.get(pos..)?;
        rest.windows(2)
            .position(|pair| pair == b"\r\n")
            .map(|i| (&rest[..i], pos + i + 2))
    }
}

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
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
            RespValue::BulkString(Some(data)) => Self::put_bulk(buf, data),
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    /// Encode a command as an array of bulk strings
    pub fn encode_command(buf: &mut BytesMut, command: &Command) {
        buf.put_u8(b'*');
        buf.extend_from_slice((command.arguments().len() + 1).to_string().as_bytes());
        buf.put_slice(b"\r\n");
        Self::put_bulk(buf, command.name().as_bytes());
        for arg in command.arguments() {
            Self::put_bulk(buf, arg);
        }
    }

    fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u8(b'$');
        buf.extend_from_slice(data.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.extend_from_slice(data);
        buf.put_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_string() {
        let mut buf = BytesMut::from("+OK\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::SimpleString("OK".to_string()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_error() {
        let mut buf = BytesMut::from("-ERR unknown command\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::Error("ERR unknown command".to_string()));
    }

    #[test]
    fn test_parse_integer() {
        let mut buf = BytesMut::from(":-1000\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::Integer(-1000));
    }

    #[test]
    fn test_parse_null_bulk_string() {
        let mut buf = BytesMut::from("$-1\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert!(result.is_null());
    }

    #[test]
    fn test_parse_pubsub_array() {
        let mut buf = BytesMut::from("*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();

        if let RespValue::Array(Some(elements)) = result {
            assert_eq!(elements.len(), 3);
            assert_eq!(elements[0].as_str(), Some("subscribe"));
            assert_eq!(elements[1].as_str(), Some("news"));
            assert_eq!(elements[2].as_integer(), Some(1));
        } else {
            panic!("Expected array");
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_array_is_not_consumed() {
        let mut buf = BytesMut::from("*2\r\n$5\r\nhello\r\n$5\r\nwor");
        assert!(RespParser::parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 22);

        buf.extend_from_slice(b"ld\r\n+OK\r\n");
        let values = RespParser::parse_all(&mut buf).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1], RespValue::SimpleString("OK".to_string()));
    }

    #[test]
    fn test_binary_bulk_with_crlf_inside() {
        let mut buf = BytesMut::from(&b"$4\r\na\r\nb\r\n"[..]);
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::bulk(b"a\r\nb"));
    }

    #[test]
    fn test_invalid_type_byte() {
        let mut buf = BytesMut::from("?what\r\n");
        assert!(RespParser::parse(&mut buf).is_err());
    }

    #[test]
    fn test_incomplete_data() {
        let mut buf = BytesMut::from("+OK\r"); // Missing \n
        let result = RespParser::parse(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_oversized_lengths_rejected() {
        let mut buf = BytesMut::from("$9223372036854775807\r\n");
        assert!(matches!(
            RespParser::parse(&mut buf),
            Err(RespParseError::InvalidFormat(_))
        ));

        let mut buf = BytesMut::from("*536870913\r\n");
        assert!(matches!(
            RespParser::parse(&mut buf),
            Err(RespParseError::InvalidFormat(_))
        ));

        // At the limit the parser still waits for more data
        let mut buf = BytesMut::from("$536870912\r\nabc");
        assert!(RespParser::parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_simple_string() {
        let value = RespValue::SimpleString("OK".to_string());
        let encoded = RespEncoder::encode(&value);
        assert_eq!(encoded, Bytes::from("+OK\r\n"));
    }

    #[test]
    fn test_encode_command() {
        let command = Command::new("set").arg("key").arg("value");
        let mut buf = BytesMut::new();
        RespEncoder::encode_command(&mut buf, &command);
        let expected = "*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
        assert_eq!(buf.freeze(), Bytes::from(expected));
    }

    #[test]
    fn test_error_reply_into_result() {
        let err = RespValue::Error("WRONGTYPE bad".to_string()).into_result().unwrap_err();
        assert!(matches!(err, ShardisError::Data { .. }));
        assert!(RespValue::Integer(1).into_result().is_ok());
    }
}
