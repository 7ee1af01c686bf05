//! Growable read buffer for the frame reader.
//!
//! Bytes are appended at the tail by socket reads and consumed from the head
//! by the parser. Consumed space is only given back by [`Buffer::reset`] (when
//! everything has been read) or [`Buffer::reclaim`] (shift unread bytes to the
//! front), so the reader decides when to pay for a copy.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

// Minimum free space made available before each socket read
const READ_CHUNK: usize = 4096;

#[derive(Debug, Default)]
pub struct Buffer {
    b: Vec<u8>,
    // read position
    i: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unread byte count.
    pub fn len(&self) -> usize {
        self.b.len() - self.i
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes consumed so far that still occupy the front of the buffer.
    pub fn read_pos(&self) -> usize {
        self.i
    }

    pub fn bytes(&self) -> &[u8] {
        &self.b[self.i..]
    }

    pub fn reset(&mut self) {
        self.b.clear();
        self.i = 0;
    }

    /// Move unread bytes to the front, releasing consumed space.
    pub fn reclaim(&mut self) {
        if self.i == 0 {
            return;
        }
        self.b.drain(..self.i);
        self.i = 0;
    }

    pub fn skip(&mut self, n: usize) {
        self.i = (self.i + n).min(self.b.len());
    }

    /// Consume the next `n` bytes, or None if fewer are buffered.
    pub fn next(&mut self, n: usize) -> Option<&[u8]> {
        if self.len() < n {
            return None;
        }
        let start = self.i;
        self.i += n;
        Some(&self.b[start..self.i])
    }

    pub fn append(&mut self, data: &[u8]) {
        self.b.extend_from_slice(data);
    }

    /// One read from `r` into the tail. A zero-length read means the peer
    /// closed its side and is reported as `UnexpectedEof`.
    pub async fn read_from_once<R>(&mut self, r: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.b.reserve(READ_CHUNK);
        let n = r.read_buf(&mut self.b).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ));
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_and_reset() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.next(5), Some(&b"hello"[..]));
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.next(7), None);
        assert_eq!(buf.len(), 6, "failed next must not consume");
        buf.skip(6);
        assert!(buf.is_empty());
        buf.reset();
        assert_eq!(buf.read_pos(), 0);
    }

    #[test]
    fn test_reclaim_keeps_unread_bytes() {
        let mut buf = Buffer::new();
        buf.append(b"0123456789");
        buf.skip(7);
        buf.reclaim();
        assert_eq!(buf.read_pos(), 0);
        assert_eq!(buf.bytes(), b"789");
        buf.append(b"ab");
        assert_eq!(buf.bytes(), b"789ab");
    }

    #[tokio::test]
    async fn test_read_from_once_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let mut buf = Buffer::new();
        let err = buf.read_from_once(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_from_once_appends() {
        use tokio::io::AsyncWriteExt;
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"AMQP").await.unwrap();
        let mut buf = Buffer::new();
        buf.append(b"xx");
        buf.skip(2);
        let n = buf.read_from_once(&mut server).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.bytes(), b"AMQP");
    }
}
