//! Length-prefixed framing shared by TCP and serial boards.
//!
//! Every message is a 4-byte big-endian length followed by a payload:
//!
//! | message   | length field        | payload                         |
//! |-----------|---------------------|---------------------------------|
//! | handshake | name length (bytes) | ASCII board name                |
//! | batch     | instruction count   | count x 4-byte big-endian words |
//! | sentinel  | 0                   | empty                           |
//! | result    | blob length (bytes) | opaque result blob              |
//!
//! [`FramedChannel`] works over anything that is `AsyncRead + AsyncWrite`,
//! so the same code drives a `TcpStream`, a `SerialStream`, or an in-memory
//! duplex pipe in tests.

use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::constants::{FRAME_HEADER_LEN, MAX_BOARD_NAME_LEN, WORD_LEN};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream, possibly partway through a frame.
    #[error("board disconnected")]
    Disconnected,
    #[error("no data from board within {0:?}")]
    Timeout(Duration),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("transport I/O error: {0}")]
    Io(io::Error),
}

impl TransportError {
    /// Whether the board went away or stalled, as opposed to breaking the
    /// protocol. Either way only that board's session ends.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::Timeout(_))
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::Disconnected,
            _ => TransportError::Io(err),
        }
    }
}

/// Stream types a board can be reached through.
pub trait BoardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BoardStream for T {}

/// Type-erased stream so TCP and serial boards can share one registry.
pub type BoxedStream = Box<dyn BoardStream>;

pub struct FramedChannel<S> {
    stream: S,
    read_timeout: Option<Duration>,
    max_frame_len: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FramedChannel<S> {
    pub fn new(stream: S, read_timeout: Option<Duration>, max_frame_len: usize) -> Self {
        Self {
            stream,
            read_timeout,
            max_frame_len,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn read_full(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let read = self.stream.read_exact(buf);
        match self.read_timeout {
            Some(limit) => {
                tokio::time::timeout(limit, read)
                    .await
                    .map_err(|_| TransportError::Timeout(limit))??;
            }
            None => {
                read.await?;
            }
        }
        Ok(())
    }

    async fn read_header(&mut self) -> Result<usize, TransportError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.read_full(&mut header).await?;
        Ok(u32::from_be_bytes(header) as usize)
    }

    async fn read_payload(&mut self, len: usize, max: usize) -> Result<Vec<u8>, TransportError> {
        if len > max {
            return Err(TransportError::FrameTooLarge { len, max });
        }
        let mut payload = vec![0u8; len];
        self.read_full(&mut payload).await?;
        Ok(payload)
    }

    async fn write_frame(&mut self, length_field: u32, payload: &[u8]) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&length_field.to_be_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the board's opening name frame. The name must be non-empty
    /// UTF-8 of at most [`MAX_BOARD_NAME_LEN`] bytes.
    pub async fn recv_handshake(&mut self) -> Result<String, TransportError> {
        let len = self.read_header().await?;
        if len == 0 {
            return Err(TransportError::Handshake("empty board name".to_string()));
        }
        if len > MAX_BOARD_NAME_LEN {
            return Err(TransportError::Handshake(format!(
                "board name of {len} bytes is longer than {MAX_BOARD_NAME_LEN}"
            )));
        }
        let payload = self.read_payload(len, MAX_BOARD_NAME_LEN).await?;
        String::from_utf8(payload)
            .map_err(|_| TransportError::Handshake("board name is not valid UTF-8".to_string()))
    }

    /// Sends `words` as one batch. The length field counts instructions.
    pub async fn send_batch(&mut self, words: &[u32]) -> Result<(), TransportError> {
        let count = u32::try_from(words.len()).map_err(|_| TransportError::FrameTooLarge {
            len: words.len(),
            max: u32::MAX as usize,
        })?;
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        self.write_frame(count, &payload).await
    }

    /// Sends the zero-length end-of-stream batch.
    pub async fn send_sentinel(&mut self) -> Result<(), TransportError> {
        self.write_frame(0, &[]).await
    }

    /// Reads one opaque result blob.
    pub async fn recv_result(&mut self) -> Result<Vec<u8>, TransportError> {
        let len = self.read_header().await?;
        self.read_payload(len, self.max_frame_len).await
    }

    /// Board side of the handshake.
    pub async fn send_handshake(&mut self, name: &str) -> Result<(), TransportError> {
        let len = u32::try_from(name.len()).map_err(|_| TransportError::FrameTooLarge {
            len: name.len(),
            max: MAX_BOARD_NAME_LEN,
        })?;
        self.write_frame(len, name.as_bytes()).await
    }

    /// Board side: reads the next batch, or `None` on the sentinel.
    pub async fn recv_batch(&mut self) -> Result<Option<Vec<u32>>, TransportError> {
        let count = self.read_header().await?;
        if count == 0 {
            return Ok(None);
        }
        let len = count.saturating_mul(WORD_LEN);
        let payload = self.read_payload(len, self.max_frame_len).await?;
        let words = payload
            .chunks_exact(WORD_LEN)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Some(words))
    }

    /// Board side: reports one result blob.
    pub async fn send_result(&mut self, blob: &[u8]) -> Result<(), TransportError> {
        let len = u32::try_from(blob.len()).map_err(|_| TransportError::FrameTooLarge {
            len: blob.len(),
            max: self.max_frame_len,
        })?;
        self.write_frame(len, blob).await
    }
}

/// Opens a serial-attached board at a fixed baud rate.
pub fn open_serial(path: impl AsRef<Path>, baud: u32) -> Result<SerialStream, TransportError> {
    let path = path.as_ref().to_string_lossy().into_owned();
    tokio_serial::new(path, baud)
        .open_native_async()
        .map_err(|e| TransportError::Io(io::Error::other(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::duplex;

    const LIMIT: usize = 1024;

    fn pair() -> (FramedChannel<tokio::io::DuplexStream>, FramedChannel<tokio::io::DuplexStream>) {
        let (host, board) = duplex(4096);
        (
            FramedChannel::new(host, None, LIMIT),
            FramedChannel::new(board, None, LIMIT),
        )
    }

    #[tokio::test]
    async fn batch_wire_format() {
        let (mut host, board) = pair();
        host.send_batch(&[0x0000_0013, 0xdead_beef]).await.unwrap();
        host.send_sentinel().await.unwrap();
        drop(host);

        let mut raw = Vec::new();
        board.into_inner().read_to_end(&mut raw).await.unwrap();
        assert_eq!(
            raw,
            vec![
                0, 0, 0, 2, // two instructions
                0x00, 0x00, 0x00, 0x13, 0xde, 0xad, 0xbe, 0xef, // big-endian words
                0, 0, 0, 0, // sentinel
            ]
        );
    }

    #[tokio::test]
    async fn board_and_host_sides_agree() {
        let (mut host, mut board) = pair();
        board.send_handshake("visionfive2").await.unwrap();
        assert_eq!(host.recv_handshake().await.unwrap(), "visionfive2");

        host.send_batch(&[0x13, 0xffff_ffff]).await.unwrap();
        assert_eq!(board.recv_batch().await.unwrap(), Some(vec![0x13, 0xffff_ffff]));
        host.send_sentinel().await.unwrap();
        assert_eq!(board.recv_batch().await.unwrap(), None);

        board.send_result(b"pc=0x80000004").await.unwrap();
        assert_eq!(host.recv_result().await.unwrap(), b"pc=0x80000004");
    }

    #[tokio::test]
    async fn short_read_is_a_disconnect() {
        let (mut host, board) = pair();
        let mut raw = board.into_inner();
        // Announces eight bytes, delivers three, then hangs up.
        raw.write_all(&[0, 0, 0, 8, 1, 2, 3]).await.unwrap();
        drop(raw);
        assert_matches!(host.recv_result().await, Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn oversized_result_is_rejected() {
        let (mut host, board) = pair();
        let mut raw = board.into_inner();
        raw.write_all(&(LIMIT as u32 + 1).to_be_bytes()).await.unwrap();
        assert_matches!(
            host.recv_result().await,
            Err(TransportError::FrameTooLarge { len, max: LIMIT }) if len == LIMIT + 1
        );
    }

    #[tokio::test]
    async fn invalid_names_fail_the_handshake() {
        let (mut host, mut board) = pair();
        board.send_handshake("").await.unwrap();
        assert_matches!(host.recv_handshake().await, Err(TransportError::Handshake(_)));

        let (mut host, board) = pair();
        let mut raw = board.into_inner();
        raw.write_all(&[0, 0, 0, 2, 0xff, 0xfe]).await.unwrap();
        assert_matches!(host.recv_handshake().await, Err(TransportError::Handshake(_)));

        let (mut host, mut board) = pair();
        board.send_handshake(&"x".repeat(MAX_BOARD_NAME_LEN + 1)).await.unwrap();
        assert_matches!(host.recv_handshake().await, Err(TransportError::Handshake(_)));
    }

    #[tokio::test]
    async fn silent_board_times_out() {
        let (host, _board) = duplex(64);
        let mut host = FramedChannel::new(host, Some(Duration::from_millis(50)), LIMIT);
        assert_matches!(
            host.recv_result().await,
            Err(TransportError::Timeout(limit)) if limit == Duration::from_millis(50)
        );
    }
}
