//! Bounded view over a reader's stream for `data` payloads.

use crate::Result;

use log::debug;

use std::cmp::min;
use std::io::{self, BufRead, Read};

/// A length-bounded, forward-only view over the bytes of a `data` field.
///
/// A `Blob` is produced by [`Reader::read`](crate::Reader::read) and borrows
/// the reader's stream, so the reader cannot be used while the view is
/// alive. The enclosing reader additionally refuses to move past the field
/// until every byte has been consumed or [`skip`](Blob::skip) has been
/// called.
///
/// The view does not support seeking backwards; the consumer stream is only
/// ever advanced.
#[derive(Debug)]
pub struct Blob<'p, R> {
    stream: &'p mut R,
    length: u32,
    remaining: &'p mut u32,
}

impl<'p, R> Blob<'p, R> {
    pub(crate) fn new(stream: &'p mut R, length: u32, remaining: &'p mut u32) -> Self {
        Blob {
            stream,
            length,
            remaining,
        }
    }

    /// The total byte length of this blob on the wire.
    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The number of bytes not yet consumed.
    pub fn bytes_remaining(&self) -> u32 {
        *self.remaining
    }
}

impl<'p, R: Read> Blob<'p, R> {
    /// Consume the rest of the blob without handing the bytes to the caller,
    /// as though all the data had been read. The next
    /// [`Reader::read`](crate::Reader::read) will then succeed.
    pub fn skip(&mut self) -> Result<()> {
        let want = u64::from(*self.remaining);
        let copied = io::copy(&mut (&mut *self.stream).take(want), &mut io::sink())?;
        if copied < want {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a data blob",
            )
            .into());
        }
        *self.remaining = 0;
        debug!("skipped {} blob bytes", want);
        Ok(())
    }
}

impl<'p, R: BufRead> Blob<'p, R> {
    /// Read one line, including the trailing newline if one is present
    /// within the blob. At most `min(limit, bytes_remaining())` bytes are
    /// returned, even if that does not form a complete line; past the end
    /// the result is empty.
    pub fn read_line(&mut self, limit: Option<u32>) -> Result<Vec<u8>> {
        let amount = match limit {
            Some(limit) => min(limit, *self.remaining),
            None => *self.remaining,
        };
        let mut buf = Vec::new();
        if amount == 0 {
            return Ok(buf);
        }
        let read = (&mut *self.stream)
            .take(u64::from(amount))
            .read_until(b'\n', &mut buf)?;
        *self.remaining -= read as u32;
        Ok(buf)
    }
}

/// Bounded reads, shaped like [`std::io::Take`]: never past the blob
/// boundary, `Ok(0)` once the blob is exhausted.
impl<'p, R: Read> Read for Blob<'p, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if *self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let cap = min(buf.len() as u64, u64::from(*self.remaining)) as usize;
        let read = self.stream.read(&mut buf[..cap])?;
        *self.remaining -= read as u32;
        Ok(read)
    }
}
