//! Newline framing for the pool byte stream.
//!
//! Pools send one JSON object per line, and TCP delivers those lines in
//! arbitrary fragments. [`LineCodec`] reassembles fragments into complete
//! lines regardless of how the stream was chunked. A line that never ends is
//! an error rather than an unbounded allocation: once the buffered bytes pass
//! the configured ceiling without a newline, decoding fails and the session
//! is torn down. A complete line that is not valid UTF-8 is logged and
//! dropped, and decoding carries on with the next one.
//!
//! Used through [`tokio_util::codec::FramedRead`], which owns the receive
//! buffer and grows it as needed starting from [`INITIAL_CAPACITY`].

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::StratumError;
use crate::tracing::prelude::*;

/// Default ceiling for a single line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Initial receive buffer size.
pub const INITIAL_CAPACITY: usize = 4096;

/// Line codec for Stratum v1.
///
/// Decodes `\n`-terminated lines (a trailing `\r` is also stripped) and
/// encodes outbound strings by appending `\n`.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,

    /// How far into the buffer we have already looked for a newline.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    /// Forget any scan progress. Call together with clearing the buffer.
    pub fn reset(&mut self) {
        self.next_index = 0;
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = StratumError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let start = self.next_index.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == b'\n') else {
                // One extra byte may be the `\r` of a line exactly at the bound
                if src.len() > self.max_length.saturating_add(1) {
                    return Err(StratumError::LineTooLong {
                        limit: self.max_length,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let newline = start + offset;
            self.next_index = 0;

            let frame = src.split_to(newline + 1);
            let mut line = &frame[..newline];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }

            if line.len() > self.max_length {
                return Err(StratumError::LineTooLong {
                    limit: self.max_length,
                });
            }

            match std::str::from_utf8(line) {
                Ok(text) => return Ok(Some(text.to_owned())),
                Err(e) => {
                    warn!(
                        len = line.len(),
                        valid_up_to = e.valid_up_to(),
                        "Dropping line that is not valid UTF-8"
                    );
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let pending = src.len();
                src.clear();
                self.reset();
                Err(StratumError::TruncatedLine { pending })
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = StratumError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use quickcheck::TestResult;
    use test_case::test_case;
    use tokio_util::codec::FramedRead;

    const STREAM: &[u8] = b"{\"id\":1,\"result\":true,\"error\":null}\n\
        {\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[512]}\r\n\
        \n\
        {\"id\":null,\"method\":\"client.reconnect\",\"params\":[]}\n";

    fn decode_in_chunks(codec: &mut LineCodec, data: &[u8], chunk: usize) -> Vec<String> {
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();
        for piece in data.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(line) = codec.decode(&mut buf).unwrap() {
                lines.push(line);
            }
        }
        assert!(buf.is_empty(), "leftover bytes: {:?}", buf);
        lines
    }

    #[test]
    fn test_single_buffer() {
        let lines = decode_in_chunks(&mut LineCodec::new(), STREAM, STREAM.len());
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "{\"id\":1,\"result\":true,\"error\":null}");
        assert!(lines[1].ends_with("[512]}"), "\\r not stripped: {}", lines[1]);
        assert_eq!(lines[2], "");
    }

    #[test_case(1; "one byte at a time")]
    #[test_case(2; "two bytes")]
    #[test_case(7; "seven bytes")]
    #[test_case(64; "sixty four bytes")]
    fn test_chunking_does_not_change_lines(chunk: usize) {
        let whole = decode_in_chunks(&mut LineCodec::new(), STREAM, STREAM.len());
        let chunked = decode_in_chunks(&mut LineCodec::new(), STREAM, chunk);
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_partial_line_waits() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":1,"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 8);

        buf.extend_from_slice(b"\"result\":true}\nnext");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("{\"id\":1,\"result\":true}")
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn test_line_longer_than_initial_capacity() {
        let long = "x".repeat(INITIAL_CAPACITY * 3);
        let data = format!("{}\n", long);
        let lines = decode_in_chunks(&mut LineCodec::new(), data.as_bytes(), 1000);
        assert_eq!(lines, vec![long]);
    }

    #[test]
    fn test_unterminated_line_over_limit_fails() {
        let mut codec = LineCodec::with_max_length(16);
        let mut buf = BytesMut::from(&[b'a'; 18][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(StratumError::LineTooLong { limit: 16 })
        ));
    }

    #[test]
    fn test_terminated_line_over_limit_fails() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"abcdef\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_framing());
    }

    #[test]
    fn test_line_at_limit_is_accepted() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"abcd\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abcd"));
    }

    #[test]
    fn test_crlf_line_at_limit_is_accepted() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"abcd\r"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abcd"));
    }

    #[test]
    fn test_crlf_line_over_limit_fails() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"abcde\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(StratumError::LineTooLong { limit: 4 })
        ));
    }

    #[test]
    fn test_invalid_utf8_line_is_dropped() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"id\":null,\"method\":\"mining.notify\",\"params\":[\"j\xff1\"]}\n");
        buf.extend_from_slice(b"{\"id\":3,\"result\":true,\"error\":null}\n");

        // The bad line is skipped and the next one comes through untouched
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("{\"id\":3,\"result\":true,\"error\":null}")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_utf8_alone_yields_nothing() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"ok\xff\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_eof_mid_line_is_an_error() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":1"[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(StratumError::TruncatedLine { pending: 7 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_eof_after_complete_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"done\n"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("done"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("{\"id\":1}".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"id\":1}\n");
    }

    #[tokio::test]
    async fn test_framed_read_over_stream() {
        let mut framed = FramedRead::with_capacity(STREAM, LineCodec::new(), INITIAL_CAPACITY);
        let mut lines = Vec::new();
        while let Some(line) = framed.next().await {
            lines.push(line.unwrap());
        }
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], "{\"id\":null,\"method\":\"client.reconnect\",\"params\":[]}");
    }

    /// Decode `data` fed in `chunk`-sized pieces, returning the lines and
    /// whatever is still buffered.
    fn decode_all(data: &[u8], chunk: usize) -> (Vec<String>, Vec<u8>) {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();
        for piece in data.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(line) = codec.decode(&mut buf).unwrap() {
                lines.push(line);
            }
        }
        (lines, buf.to_vec())
    }

    #[quickcheck_macros::quickcheck]
    fn chunking_never_changes_the_lines(data: Vec<u8>, chunk: usize) -> TestResult {
        if data.len() > DEFAULT_MAX_LINE_LENGTH {
            return TestResult::discard();
        }
        let chunk = chunk % 16 + 1;
        TestResult::from_bool(decode_all(&data, data.len().max(1)) == decode_all(&data, chunk))
    }

    #[quickcheck_macros::quickcheck]
    fn valid_lines_round_trip(lines: Vec<String>) -> bool {
        let lines: Vec<String> = lines
            .into_iter()
            .map(|line| line.replace(['\n', '\r'], ""))
            .collect();
        let mut data = Vec::new();
        for line in &lines {
            data.extend_from_slice(line.as_bytes());
            data.push(b'\n');
        }
        decode_all(&data, 3) == (lines, Vec::new())
    }
}
