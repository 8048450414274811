//! Message channels between peers.
//!
//! The protocol only needs an ordered, reliable stream of whole messages in
//! each direction. [`memory_channel`] provides one inside a process; [`framed`]
//! runs length-prefixed JSON over any tokio byte stream such as a TCP socket.

use crate::message::{decode_length, decode_message, encode_message, WireMessage};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame arrived whole but did not decode; the stream is still usable.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Connection closed")]
    ConnectionClosed,
}

/// The sending half of a channel.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), WireError>;
}

/// The receiving half of a channel. `Ok(None)` means the peer hung up.
#[async_trait]
pub trait MessageSource: Send {
    async fn recv(&mut self) -> Result<Option<WireMessage>, WireError>;
}

// ---------------------------------------------------------------------------
// In-process channel
// ---------------------------------------------------------------------------

pub struct MemorySink {
    tx: mpsc::UnboundedSender<WireMessage>,
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

/// Two connected ends of an in-process channel.
pub fn memory_channel() -> ((MemorySink, MemorySource), (MemorySink, MemorySource)) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        (MemorySink { tx: a_tx }, MemorySource { rx: a_rx }),
        (MemorySink { tx: b_tx }, MemorySource { rx: b_rx }),
    )
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), WireError> {
        self.tx
            .send(msg.clone())
            .map_err(|_| WireError::ConnectionClosed)
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<WireMessage>, WireError> {
        Ok(self.rx.recv().await)
    }
}

// ---------------------------------------------------------------------------
// Length-prefixed JSON over a byte stream
// ---------------------------------------------------------------------------

/// Writes framed messages (4-byte length + JSON).
pub struct FramedSink<W> {
    writer: W,
    max_message_size: u32,
}

/// Reads framed messages (4-byte length + JSON).
pub struct FramedSource<R> {
    reader: R,
    max_message_size: u32,
}

impl<W> FramedSink<W> {
    pub fn new(writer: W, max_message_size: u32) -> Self {
        Self {
            writer,
            max_message_size,
        }
    }
}

impl<R> FramedSource<R> {
    pub fn new(reader: R, max_message_size: u32) -> Self {
        Self {
            reader,
            max_message_size,
        }
    }
}

/// Split a byte stream into a framed sink and source.
pub fn framed<T>(stream: T, max_message_size: u32) -> (FramedSink<WriteHalf<T>>, FramedSource<ReadHalf<T>>)
where
    T: AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        FramedSink::new(writer, max_message_size),
        FramedSource::new(reader, max_message_size),
    )
}

#[async_trait]
impl<W> MessageSink for FramedSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &WireMessage) -> Result<(), WireError> {
        let bytes = encode_message(msg)?;
        let size = (bytes.len() - 4) as u32;
        if size > self.max_message_size {
            return Err(WireError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<R> MessageSource for FramedSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<WireMessage>, WireError> {
        let mut header = [0u8; 4];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WireError::Io(e)),
        }

        let len = decode_length(&header);
        if len > self.max_message_size {
            return Err(WireError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }

        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body).await?;

        let msg = decode_message(&body)?;
        Ok(Some(msg))
    }
}
