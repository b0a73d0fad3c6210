//! Framed stream over the worker's stdio pipes.
//!
//! Works over any AsyncRead/AsyncWrite (pipes, duplex streams in tests).
//! One frame is a single opcode byte followed, for payload-carrying opcodes,
//! by a 4-byte little-endian length and that many codec bytes. Large payloads
//! are written in chunks with a flush after each chunk so the child gets a
//! chance to drain its input pipe.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Chunk size for large payload writes.
pub const WRITE_CHUNK: usize = 64 * 1024;

/// Frames longer than this are treated as desynchronization.
pub const MAX_FRAME: usize = 256 * 1024 * 1024;

/// How long the stream must stay quiet before a drain gives up.
const DRAIN_QUIET: Duration = Duration::from_millis(50);

/// Opcodes written to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    Exec,
    Eval,
    SendObject,
    RetrieveObject,
    Input,
    Quit,
}

impl SendOpcode {
    pub fn byte(self) -> u8 {
        match self {
            SendOpcode::Exec => b'e',
            SendOpcode::Eval => b'c',
            SendOpcode::SendObject => b'r',
            SendOpcode::RetrieveObject => b's',
            SendOpcode::Input => b'i',
            SendOpcode::Quit => b'q',
        }
    }
}

/// Opcodes read back from the worker.
///
/// `e` is exec in the send direction but stderr in the reply direction;
/// the two never meet because each direction has its own pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOpcode {
    Stdout,
    Stderr,
    InputRequest,
    Result,
    ResultAlt,
}

impl ReplyOpcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'o' => ReplyOpcode::Stdout,
            b'e' => ReplyOpcode::Stderr,
            b'i' => ReplyOpcode::InputRequest,
            b'x' => ReplyOpcode::Result,
            b'b' => ReplyOpcode::ResultAlt,
            _ => return None,
        })
    }

    pub fn is_result(self) -> bool {
        matches!(self, ReplyOpcode::Result | ReplyOpcode::ResultAlt)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("i/o failure on worker pipe: {0}")]
    Io(#[from] io::Error),
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),
}

/// Reads and writes length-prefixed frames over the child's pipes.
pub struct ChannelStream<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> ChannelStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Write a bare opcode (used for `q`).
    pub async fn write_opcode(&mut self, opcode: SendOpcode) -> Result<(), ChannelError> {
        self.writer.write_all(&[opcode.byte()]).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Write an opcode followed by one length-prefixed payload.
    pub async fn write_frame(
        &mut self,
        opcode: SendOpcode,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        self.writer.write_all(&[opcode.byte()]).await?;
        self.write_payload(payload).await
    }

    /// Write a length-prefixed payload without an opcode (the second frame of
    /// a send-object command).
    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > u32::MAX as usize {
            return Err(ChannelError::Oversized(payload.len()));
        }
        if payload.len() > 100_000 {
            tracing::info!(payload_bytes = payload.len(), "large frame being written");
        }
        self.writer
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await?;
        for chunk in payload.chunks(WRITE_CHUNK) {
            self.writer.write_all(chunk).await?;
            self.writer.flush().await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next opcode byte, blocking until one is available.
    pub async fn read_opcode(&mut self) -> Result<u8, ChannelError> {
        let mut byte = [0u8; 1];
        let n = self.reader.read(&mut byte).await?;
        if n == 0 {
            return Err(ChannelError::ShortRead { wanted: 1, got: 0 });
        }
        Ok(byte[0])
    }

    /// Read one length-prefixed payload. A stream that closes mid-frame
    /// surfaces as `ShortRead`.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, ChannelError> {
        let len = self.read_exact_buf(4).await?;
        let len = u32::from_le_bytes(len.try_into().expect("buffer is 4 bytes")) as usize;
        if len > MAX_FRAME {
            return Err(ChannelError::Oversized(len));
        }
        self.read_exact_buf(len).await
    }

    async fn read_exact_buf(&mut self, wanted: usize) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; wanted];
        let mut got = 0;
        while got < wanted {
            let n = self.reader.read(&mut buf[got..]).await?;
            if n == 0 {
                return Err(ChannelError::ShortRead { wanted, got });
            }
            got += n;
        }
        Ok(buf)
    }

    /// Discard whatever is buffered on the read side until the stream stays
    /// quiet. Used to resynchronize after an unexpected opcode or a decode
    /// failure.
    pub async fn drain(&mut self) -> usize {
        let mut total = 0;
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(DRAIN_QUIET, self.reader.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => total += n,
                _ => break,
            }
        }
        if total > 0 {
            tracing::debug!(discarded = total, "flushed desynchronized channel bytes");
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        ChannelStream<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        ChannelStream<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (ChannelStream::new(ar, aw), ChannelStream::new(br, bw))
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut left, mut right) = pair();
        left.write_frame(SendOpcode::Exec, b"print(1)").await.unwrap();

        assert_eq!(right.read_opcode().await.unwrap(), b'e');
        assert_eq!(right.read_frame().await.unwrap(), b"print(1)");
    }

    #[tokio::test]
    async fn chunked_write_of_large_payload() {
        let (mut left, mut right) = pair();
        let payload: Vec<u8> = (0..WRITE_CHUNK * 3 + 17).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            left.write_frame(SendOpcode::SendObject, &payload)
                .await
                .unwrap();
        });

        assert_eq!(right.read_opcode().await.unwrap(), b'r');
        assert_eq!(right.read_frame().await.unwrap(), expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn short_read_is_a_failure() {
        let (mut left, mut right) = pair();
        // Announce 100 bytes but deliver 10, then close.
        left.writer.write_all(&[b'x']).await.unwrap();
        left.writer.write_all(&100u32.to_le_bytes()).await.unwrap();
        left.writer.write_all(&[0u8; 10]).await.unwrap();
        drop(left);

        assert_eq!(right.read_opcode().await.unwrap(), b'x');
        match right.read_frame().await {
            Err(ChannelError::ShortRead { wanted: 100, got: 10 }) => {}
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_stream_reports_short_opcode_read() {
        let (left, mut right) = pair();
        drop(left);
        assert!(matches!(
            right.read_opcode().await,
            Err(ChannelError::ShortRead { wanted: 1, got: 0 })
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut left, mut right) = pair();
        left.writer.write_all(&[b'x']).await.unwrap();
        left.writer
            .write_all(&(u32::MAX).to_le_bytes())
            .await
            .unwrap();
        left.writer.flush().await.unwrap();

        right.read_opcode().await.unwrap();
        assert!(matches!(
            right.read_frame().await,
            Err(ChannelError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn drain_discards_garbage() {
        let (mut left, mut right) = pair();
        left.writer.write_all(&[0xAB; 300]).await.unwrap();
        left.writer.flush().await.unwrap();

        assert_eq!(right.drain().await, 300);
    }
}
