//! Streaming RESP decoder.
//!
//! Two entry points: [`Decoder::decode`] reads one frame of any type (the
//! backend-response path); [`Decoder::decode_multi_bulk`] reads one
//! multi-bulk command (the client-request path), accepting the inline
//! fallback when the first byte is not the array tag.
//!
//! The first error latches the decoder: every later call fails with
//! `failed-decoder`. Callers terminate the connection on any error.

use super::{RespFrame, MAX_ARRAY_LEN, MAX_BULK_BYTES};
use crate::error::{Error, ProtocolError, Result};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

const DEFAULT_BUFSIZE: usize = 8 * 1024;

/// Parse an ASCII decimal, fast-pathing the short numerals that dominate
/// length prefixes.
pub(crate) fn btoi64(b: &[u8]) -> Result<i64> {
    if !b.is_empty() && b.len() < 10 {
        let (neg, digits) = match b[0] {
            b'-' => (true, &b[1..]),
            b'+' => (false, &b[1..]),
            _ => (false, b),
        };
        if !digits.is_empty() && digits.iter().all(|c| c.is_ascii_digit()) {
            let mut n: i64 = 0;
            for &c in digits {
                n = n * 10 + i64::from(c - b'0');
            }
            return Ok(if neg { -n } else { n });
        }
    }
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::BadInteger.into())
}

fn valid_bulk_len(n: i64) -> Result<()> {
    match n {
        n if n < -1 => Err(ProtocolError::BadBulkLen.into()),
        n if n > MAX_BULK_BYTES => Err(ProtocolError::BadBulkLenTooLong.into()),
        _ => Ok(()),
    }
}

fn valid_array_len(n: i64) -> Result<()> {
    match n {
        n if n < -1 => Err(ProtocolError::BadArrayLen.into()),
        n if n > MAX_ARRAY_LEN => Err(ProtocolError::BadArrayLenTooLong.into()),
        _ => Ok(()),
    }
}

fn unexpected_eof() -> Error {
    io::Error::from(io::ErrorKind::UnexpectedEof).into()
}

/// Streaming decoder over a buffered byte source.
pub struct Decoder<R> {
    rd: BufReader<R>,
    failed: bool,
}

impl<R: AsyncRead + Unpin + Send> Decoder<R> {
    /// Wrap a byte source with the default buffer size.
    pub fn new(rd: R) -> Self {
        Self::with_capacity(rd, DEFAULT_BUFSIZE)
    }

    /// Wrap a byte source with an explicit buffer size.
    pub fn with_capacity(rd: R, capacity: usize) -> Self {
        Self {
            rd: BufReader::with_capacity(capacity.max(64), rd),
            failed: false,
        }
    }

    /// Decode one frame of any type.
    pub async fn decode(&mut self) -> Result<RespFrame> {
        if self.failed {
            return Err(ProtocolError::FailedDecoder.into());
        }
        match self.decode_frame().await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// Decode one client command: a multi-bulk array of bulk strings, or
    /// an inline command line. An empty inline line yields an empty vec.
    pub async fn decode_multi_bulk(&mut self) -> Result<Vec<RespFrame>> {
        if self.failed {
            return Err(ProtocolError::FailedDecoder.into());
        }
        match self.decode_multi().await {
            Ok(multi) => Ok(multi),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    async fn peek_byte(&mut self) -> Result<u8> {
        let buf = self.rd.fill_buf().await?;
        buf.first().copied().ok_or_else(unexpected_eof)
    }

    async fn read_byte(&mut self) -> Result<u8> {
        let b = self.peek_byte().await?;
        self.rd.consume(1);
        Ok(b)
    }

    /// Read one line and strip the CRLF terminator.
    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let n = self.rd.read_until(b'\n', &mut line).await?;
        if n == 0 || line.last() != Some(&b'\n') {
            return Err(unexpected_eof());
        }
        line.pop();
        if line.pop() != Some(b'\r') {
            return Err(ProtocolError::BadCrlf.into());
        }
        Ok(line)
    }

    async fn read_int(&mut self) -> Result<i64> {
        let line = self.read_line().await?;
        btoi64(&line)
    }

    fn decode_frame<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<RespFrame>> + Send + 'a>> {
        Box::pin(async move {
            let tag = self.read_byte().await?;
            match tag {
                b'+' => Ok(RespFrame::Simple(Bytes::from(self.read_line().await?))),
                b'-' => Ok(RespFrame::Error(Bytes::from(self.read_line().await?))),
                b':' => Ok(RespFrame::Integer(self.read_int().await?)),
                b'$' => self.decode_bulk().await,
                b'*' => self.decode_array().await,
                other => Err(ProtocolError::BadFrameType(other).into()),
            }
        })
    }

    async fn decode_bulk(&mut self) -> Result<RespFrame> {
        let n = self.read_int().await?;
        valid_bulk_len(n)?;
        if n == -1 {
            return Ok(RespFrame::Bulk(None));
        }
        let n = n as usize;
        let mut body = vec![0u8; n + 2];
        self.rd.read_exact(&mut body).await?;
        if body[n] != b'\r' || body[n + 1] != b'\n' {
            return Err(ProtocolError::BadCrlf.into());
        }
        body.truncate(n);
        Ok(RespFrame::Bulk(Some(Bytes::from(body))))
    }

    async fn decode_array(&mut self) -> Result<RespFrame> {
        let n = self.read_int().await?;
        valid_array_len(n)?;
        if n == -1 {
            return Ok(RespFrame::Array(None));
        }
        let mut array = Vec::with_capacity(n as usize);
        for _ in 0..n {
            array.push(self.decode_frame().await?);
        }
        Ok(RespFrame::Array(Some(array)))
    }

    async fn decode_multi(&mut self) -> Result<Vec<RespFrame>> {
        if self.peek_byte().await? != b'*' {
            return self.decode_inline().await;
        }
        self.rd.consume(1);
        let n = self.read_int().await?;
        if n <= 0 {
            return Err(ProtocolError::BadArrayLen.into());
        }
        if n > MAX_ARRAY_LEN {
            return Err(ProtocolError::BadArrayLenTooLong.into());
        }
        let mut multi = Vec::with_capacity(n as usize);
        for _ in 0..n {
            match self.decode_frame().await? {
                frame @ RespFrame::Bulk(_) => multi.push(frame),
                _ => return Err(ProtocolError::BadMultiBulkContent.into()),
            }
        }
        Ok(multi)
    }

    /// Inline fallback: a line of space-separated tokens is promoted to a
    /// bulk-string array. An empty line is a no-op; a line of only
    /// separators is an error.
    async fn decode_inline(&mut self) -> Result<Vec<RespFrame>> {
        let line = self.read_line().await?;
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let multi: Vec<RespFrame> = line
            .split(|&b| b == b' ')
            .filter(|token| !token.is_empty())
            .map(|token| RespFrame::bulk(Bytes::copy_from_slice(token)))
            .collect();
        if multi.is_empty() {
            return Err(ProtocolError::BadMultiBulkLen.into());
        }
        Ok(multi)
    }
}
