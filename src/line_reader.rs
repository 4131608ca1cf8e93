use std::io;

use bytes::{Buf, Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads CRLF-terminated command lines, and the fixed-size job bodies that
/// follow some of them, from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but not yet handed out.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Longest line accepted before giving up on the peer.
    max_line_len: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    pub fn with_max_line_len(reader: T, max_line_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            max_line_len,
            reader,
            pending_error: None,
        }
    }

    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, so either a complete read occurs and is
    /// processed, or this is cancelled.
    ///
    /// A line longer than the configured maximum yields an `InvalidData`
    /// error; there's no sensible way to resynchronise after one.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Scan from one byte before the newest data, in case a \r arrived
            // at the end of the previous read and its \n at the start of this
            // one. Pipelined lines already in the buffer are handed out before
            // any further read.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let cmd =
                    self.buf.split_to(self.maybe_crlf_from + eoc + 2).freeze();

                // Drop trailing b"\r\n".
                let cmd = cmd.slice(0..cmd.len() - 2);

                self.maybe_crlf_from = 0;

                return Ok(Some(cmd));
            }

            if self.buf.len() > self.max_line_len + 1 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }

            let n_bytes_read = self.fill().await;

            // Set maybe_crlf_from to the byte before the first byte returned
            // in the read (and 0 if buf is empty).
            self.maybe_crlf_from =
                self.buf.len().checked_sub(n_bytes_read + 1).unwrap_or(0);

            if n_bytes_read == 0 {
                return self.end_of_stream();
            }
        }
    }

    /// Reads a body of exactly `n` bytes plus whatever two bytes follow it.
    /// Returns the body and whether those two bytes were a CRLF, or None if
    /// the stream ended first.
    pub async fn read_body(
        &mut self,
        n: usize,
    ) -> io::Result<Option<(Bytes, bool)>> {
        while self.buf.len() < n + 2 {
            if self.fill().await == 0 {
                return self.end_of_stream();
            }
        }

        let body = self.buf.split_to(n + 2).freeze();
        let terminated = body.ends_with(b"\r\n");
        self.maybe_crlf_from = 0;

        Ok(Some((body.slice(0..n), terminated)))
    }

    /// Discards `n` bytes, such as the body of a job that's too big to accept,
    /// without buffering them all at once. Returns false if the stream ended.
    pub async fn skip(&mut self, mut n: usize) -> io::Result<bool> {
        loop {
            let take = n.min(self.buf.len());
            self.buf.advance(take);
            n -= take;

            if n == 0 {
                self.maybe_crlf_from = 0;
                return Ok(true);
            }

            if self.fill().await == 0 {
                return self.end_of_stream().map(|_: Option<()>| false);
            }
        }
    }

    /// Reads more data into the buffer, stashing any error for later.
    async fn fill(&mut self) -> usize {
        match self.reader.read_buf(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                self.pending_error = Some(e);
                0
            },
        }
    }

    fn end_of_stream<R>(&mut self) -> io::Result<Option<R>> {
        match self.pending_error.take() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self::with_max_line_len(value, crate::parser::MAX_LINE_LEN)
    }
}
