//! Transport handles: one remote connection split into per-channel readers,
//! a frame writer and a control handle.
//!
//! A [`Transport`] is produced by a backend and consumed by a connection,
//! which splits it with [`Transport::into_parts`] so that reader tasks own
//! their channel while writes and shutdown stay with the connection.

mod demux;

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{Channel, encode_frame};

pub use demux::ChannelDemuxer;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The write side failed; readers see this instead of a clean end.
    #[error("{0}")]
    WriteFailed(Box<TransportError>),
}

/// Whether the remote side can still be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closed,
}

/// Item delivered to a channel reader by the read pump.
pub(crate) type ChannelItem = Result<Vec<u8>, TransportError>;

/// Read side of one demultiplexed channel.
#[derive(Debug)]
pub struct ChannelReader {
    channel: Channel,
    rx: mpsc::Receiver<ChannelItem>,
}

impl ChannelReader {
    pub(crate) const fn new(channel: Channel, rx: mpsc::Receiver<ChannelItem>) -> Self {
        Self { channel, rx }
    }

    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Next chunk; `Ok(None)` once the remote closed the stream.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.rx.recv().await.transpose()
    }
}

/// Write side of the transport. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl FrameWriter {
    pub(crate) const fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Send `payload` on `channel`.
    pub async fn send(&self, channel: Channel, payload: &[u8]) -> Result<(), TransportError> {
        self.send_frame(encode_frame(channel, payload)).await
    }

    /// Send an already-encoded frame.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

/// Liveness and shutdown of the pumps behind a transport.
#[derive(Debug)]
pub struct TransportControl {
    state: watch::Receiver<TransportState>,
    shutdown: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
    closed: bool,
}

impl TransportControl {
    pub(crate) const fn new(
        state: watch::Receiver<TransportState>,
        shutdown: CancellationToken,
        pumps: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            state,
            shutdown,
            pumps,
            closed: false,
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Signal the pumps to stop without waiting for them.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Stop the pumps and wait up to `timeout` for them to exit.
    /// Pumps still running after that are aborted.
    pub async fn close(&mut self, timeout: Duration) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown.cancel();
        for mut pump in self.pumps.drain(..) {
            if tokio::time::timeout(timeout, &mut pump).await.is_err() {
                warn!("Transport pump did not stop in time, aborting");
                pump.abort();
            }
        }
        debug!("Transport closed");
    }
}

/// A connected transport as handed out by a backend.
#[derive(Debug)]
pub struct Transport {
    writer: Option<FrameWriter>,
    readers: Vec<ChannelReader>,
    control: TransportControl,
}

impl Transport {
    pub(crate) const fn new(
        writer: Option<FrameWriter>,
        readers: Vec<ChannelReader>,
        control: TransportControl,
    ) -> Self {
        Self {
            writer,
            readers,
            control,
        }
    }

    /// Wrap a plain byte stream (e.g. an HTTP log body) as a read-only
    /// transport with a single channel.
    pub fn from_stream<S>(channel: Channel, stream: S, capacity: usize) -> Self
    where
        S: Stream<Item = Result<Vec<u8>, TransportError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (state_tx, state_rx) = watch::channel(TransportState::Open);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let pump = tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                let item = tokio::select! {
                    () = token.cancelled() => break,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(chunk)) if chunk.is_empty() => {}
                    Some(Ok(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    None => break,
                }
            }
            let _ = state_tx.send(TransportState::Closed);
            debug!(%channel, "Stream pump finished");
        });

        Self::new(
            None,
            vec![ChannelReader::new(channel, rx)],
            TransportControl::new(state_rx, shutdown, vec![pump]),
        )
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.readers.iter().map(ChannelReader::channel).collect()
    }

    pub const fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    pub fn into_parts(self) -> (Option<FrameWriter>, Vec<ChannelReader>, TransportControl) {
        (self.writer, self.readers, self.control)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_stream::wrappers::ReceiverStream;

    #[tokio::test]
    async fn stream_transport_delivers_chunks_then_end() {
        let (tx, rx) = mpsc::channel(8);
        let transport = Transport::from_stream(Channel::Stdout, ReceiverStream::new(rx), 8);
        assert!(!transport.has_writer());
        assert_eq!(transport.channels(), vec![Channel::Stdout]);

        let (_, mut readers, control) = transport.into_parts();
        tx.send(Ok(b"line one\n".to_vec())).await.unwrap();
        drop(tx);

        let reader = &mut readers[0];
        assert_eq!(reader.read().await.unwrap(), Some(b"line one\n".to_vec()));
        assert_eq!(reader.read().await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!control.is_open());
    }

    #[tokio::test]
    async fn stream_transport_forwards_errors() {
        let (tx, rx) = mpsc::channel(8);
        let transport = Transport::from_stream(Channel::Stdout, ReceiverStream::new(rx), 8);
        let (_, mut readers, _control) = transport.into_parts();

        tx.send(Err(TransportError::Io("reset".into()))).await.unwrap();

        let err = readers[0].read().await.unwrap_err();
        assert_eq!(err, TransportError::Io("reset".into()));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_tx, rx) = mpsc::channel::<Result<Vec<u8>, TransportError>>(8);
        let transport = Transport::from_stream(Channel::Stdout, ReceiverStream::new(rx), 8);
        let (_, _readers, mut control) = transport.into_parts();

        control.close(Duration::from_secs(1)).await;
        control.close(Duration::from_secs(1)).await;
        assert!(!control.is_open());
    }
}
