//! # Chaincode Streams
//!
//! The bidirectional message channel between the peer and one running unit.
//! `send` may be called concurrently with `recv` and with other `send`s.
//!
//! ## Implementations
//!
//! - [`DuplexStream`]: in-process pair over mpsc channels.
//! - [`FramedStream`]: any tokio byte stream, using ccwire framing.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use ccwire::ChaincodeMessage;
use ccwire::frame;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::StreamError;

#[async_trait::async_trait]
pub trait ChaincodeStream: Send + Sync + 'static {
    async fn send(&self, msg: &ChaincodeMessage) -> Result<(), StreamError>;

    /// Next message, or `None` once the other side has closed.
    async fn recv(&self) -> Result<Option<ChaincodeMessage>, StreamError>;
}

/// One end of an in-process stream pair.
pub struct DuplexStream {
    tx: mpsc::UnboundedSender<ChaincodeMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<ChaincodeMessage>>,
}

impl DuplexStream {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self { tx: tx_a, rx: Mutex::new(rx_b) };
        let b = Self { tx: tx_b, rx: Mutex::new(rx_a) };
        (a, b)
    }
}

#[async_trait::async_trait]
impl ChaincodeStream for DuplexStream {
    async fn send(&self, msg: &ChaincodeMessage) -> Result<(), StreamError> {
        self.tx.send(msg.clone()).map_err(|_| StreamError::Closed)
    }

    async fn recv(&self) -> Result<Option<ChaincodeMessage>, StreamError> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// A stream over async byte halves, one length-prefixed record per message.
///
/// A send abandoned partway through a frame leaves the byte stream out of
/// sync; every later send then fails with [`StreamError::Closed`].
pub struct FramedStream<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    torn: AtomicBool,
    max_frame_len: usize,
}

/// Marks the writer torn unless the frame it guards completes.
struct FrameInProgress<'a> {
    torn: &'a AtomicBool,
    done: bool,
}

impl Drop for FrameInProgress<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.torn.store(true, Ordering::SeqCst);
        }
    }
}

impl<R, W> FramedStream<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_max_frame_len(reader, writer, frame::DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(reader: R, writer: W, max_frame_len: usize) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            torn: AtomicBool::new(false),
            max_frame_len,
        }
    }
}

impl<T> FramedStream<ReadHalf<T>, WriteHalf<T>>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn from_io(io: T) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self::new(reader, writer)
    }
}

#[async_trait::async_trait]
impl<R, W> ChaincodeStream for FramedStream<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, msg: &ChaincodeMessage) -> Result<(), StreamError> {
        let mut writer = self.writer.lock().await;
        if self.torn.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let mut guard = FrameInProgress { torn: &self.torn, done: false };
        frame::write_message(&mut *writer, msg).await?;
        guard.done = true;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<ChaincodeMessage>, StreamError> {
        let mut reader = self.reader.lock().await;
        Ok(frame::read_message(&mut *reader, self.max_frame_len).await?)
    }
}
