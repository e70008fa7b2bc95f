//! Channel demultiplexer over a framed bidirectional transport.
//!
//! Two pumps run per transport:
//! - the read pump decodes inbound frames and routes each payload to the
//!   reader registered for its channel;
//! - the write pump drains the [`FrameWriter`] queue onto the sink.
//!
//! Either pump ending marks the transport closed and stops the other one.
//! A sink failure is handed to the read pump, which delivers it to every
//! reader as [`TransportError::WriteFailed`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ChannelItem, ChannelReader, FrameWriter, Transport, TransportControl, TransportError,
    TransportState,
};
use crate::channel::{Channel, decode_frame};

/// Splits one framed transport into per-channel readers and a writer.
pub struct ChannelDemuxer;

impl ChannelDemuxer {
    /// Start the pumps and return the transport handle.
    ///
    /// `inbound` lists the channels that get a reader; frames for any other
    /// channel are dropped.
    pub fn start<S, K>(stream: S, sink: K, inbound: &[Channel], capacity: usize) -> Transport
    where
        S: Stream<Item = Result<Vec<u8>, TransportError>> + Send + 'static,
        K: Sink<Vec<u8>, Error = TransportError> + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (state_tx, state_rx) = watch::channel(TransportState::Open);
        let state_tx = Arc::new(state_tx);
        let shutdown = CancellationToken::new();

        let mut routes = HashMap::new();
        let mut readers = Vec::with_capacity(inbound.len());
        for &channel in inbound {
            let (tx, rx) = mpsc::channel(capacity);
            routes.insert(channel, tx);
            readers.push(ChannelReader::new(channel, rx));
        }

        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let (failed_tx, failed_rx) = mpsc::channel(1);

        let read_pump = tokio::spawn(read_pump(
            stream,
            routes,
            failed_rx,
            Arc::clone(&state_tx),
            shutdown.clone(),
        ));
        let write_pump = tokio::spawn(write_pump(
            sink,
            frame_rx,
            failed_tx,
            state_tx,
            shutdown.clone(),
        ));

        Transport::new(
            Some(FrameWriter::new(frame_tx)),
            readers,
            TransportControl::new(state_rx, shutdown, vec![read_pump, write_pump]),
        )
    }
}

async fn read_pump<S>(
    stream: S,
    mut routes: HashMap<Channel, mpsc::Sender<ChannelItem>>,
    mut write_failed: mpsc::Receiver<TransportError>,
    state: Arc<watch::Sender<TransportState>>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<Vec<u8>, TransportError>> + Send,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        let item = tokio::select! {
            biased;
            Some(e) = write_failed.recv() => {
                fan_out(&routes, TransportError::WriteFailed(Box::new(e))).await;
                break;
            }
            () = shutdown.cancelled() => break,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(frame)) => route_frame(&frame, &mut routes).await,
            Some(Err(e)) => {
                warn!(error = %e, "Transport read failed");
                fan_out(&routes, e).await;
                break;
            }
            None => {
                debug!("Remote closed the transport");
                break;
            }
        }
    }
    state.send_replace(TransportState::Closed);
    shutdown.cancel();
}

async fn fan_out(routes: &HashMap<Channel, mpsc::Sender<ChannelItem>>, error: TransportError) {
    for tx in routes.values() {
        let _ = tx.send(Err(error.clone())).await;
    }
}

async fn route_frame(frame: &[u8], routes: &mut HashMap<Channel, mpsc::Sender<ChannelItem>>) {
    let (channel, payload) = match decode_frame(frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(error = %e, "Dropping malformed frame");
            return;
        }
    };
    if payload.is_empty() {
        return;
    }
    if channel == Channel::Status {
        log_remote_status(payload);
        return;
    }
    let Some(tx) = routes.get(&channel) else {
        debug!(%channel, bytes = payload.len(), "Dropping frame for unrouted channel");
        return;
    };
    if tx.send(Ok(payload.to_vec())).await.is_err() {
        debug!(%channel, "Channel reader gone, unrouting");
        routes.remove(&channel);
    }
}

fn log_remote_status(payload: &[u8]) {
    match serde_json::from_slice::<Value>(payload) {
        Ok(status) => {
            let outcome = status["status"].as_str().unwrap_or("Unknown");
            let message = status["message"].as_str().unwrap_or_default();
            info!(outcome, message, "Remote process reported status");
        }
        Err(e) => debug!(error = %e, "Unparsable status frame"),
    }
}

async fn write_pump<K>(
    sink: K,
    mut frames: mpsc::Receiver<Vec<u8>>,
    failed: mpsc::Sender<TransportError>,
    state: Arc<watch::Sender<TransportState>>,
    shutdown: CancellationToken,
) where
    K: Sink<Vec<u8>, Error = TransportError> + Send,
{
    let mut sink = std::pin::pin!(sink);
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "Transport write failed");
            state.send_replace(TransportState::Closed);
            let _ = failed.send(e).await;
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Closing transport sink failed");
    }
    state.send_replace(TransportState::Closed);
    shutdown.cancel();
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::encode_frame;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_util::sync::PollSender;

    struct Wire {
        inbound_tx: mpsc::Sender<Result<Vec<u8>, TransportError>>,
        outbound_rx: mpsc::Receiver<Vec<u8>>,
    }

    fn demux(channels: &[Channel]) -> (Transport, Wire) {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let sink = PollSender::new(outbound_tx).sink_map_err(|_| TransportError::Closed);
        let transport =
            ChannelDemuxer::start(ReceiverStream::new(inbound_rx), sink, channels, 16);
        (
            transport,
            Wire {
                inbound_tx,
                outbound_rx,
            },
        )
    }

    #[tokio::test]
    async fn routes_frames_by_channel() {
        let (transport, wire) = demux(&[Channel::Stdout, Channel::Stderr]);
        let (_, mut readers, _control) = transport.into_parts();

        wire.inbound_tx
            .send(Ok(encode_frame(Channel::Stderr, b"err")))
            .await
            .unwrap();
        wire.inbound_tx
            .send(Ok(encode_frame(Channel::Stdout, b"out")))
            .await
            .unwrap();

        assert_eq!(readers[0].channel(), Channel::Stdout);
        assert_eq!(readers[0].read().await.unwrap(), Some(b"out".to_vec()));
        assert_eq!(readers[1].read().await.unwrap(), Some(b"err".to_vec()));
    }

    #[tokio::test]
    async fn unrouted_status_and_empty_frames_are_dropped() {
        let (transport, wire) = demux(&[Channel::Stdout]);
        let (_, mut readers, _control) = transport.into_parts();

        for frame in [
            encode_frame(Channel::Stderr, b"ignored"),
            encode_frame(Channel::Status, br#"{"status":"Success"}"#),
            encode_frame(Channel::Stdout, b""),
            vec![9, 1, 2],
            Vec::new(),
            encode_frame(Channel::Stdout, b"kept"),
        ] {
            wire.inbound_tx.send(Ok(frame)).await.unwrap();
        }

        assert_eq!(readers[0].read().await.unwrap(), Some(b"kept".to_vec()));
    }

    #[tokio::test]
    async fn writer_frames_reach_the_sink() {
        let (transport, mut wire) = demux(&[Channel::Stdout]);
        let (writer, _readers, _control) = transport.into_parts();

        writer.unwrap().send(Channel::Stdin, b"ls\n").await.unwrap();

        assert_eq!(wire.outbound_rx.recv().await.unwrap(), b"\0ls\n".to_vec());
    }

    #[tokio::test]
    async fn remote_close_ends_every_reader() {
        let (transport, wire) = demux(&[Channel::Stdout, Channel::Stderr]);
        let (_, mut readers, control) = transport.into_parts();

        drop(wire.inbound_tx);

        assert_eq!(readers[0].read().await.unwrap(), None);
        assert_eq!(readers[1].read().await.unwrap(), None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!control.is_open());
    }

    #[tokio::test]
    async fn read_error_fans_out_to_every_reader() {
        let (transport, wire) = demux(&[Channel::Stdout, Channel::Stderr]);
        let (_, mut readers, _control) = transport.into_parts();

        wire.inbound_tx
            .send(Err(TransportError::Io("connection reset".into())))
            .await
            .unwrap();

        for reader in &mut readers {
            let err = reader.read().await.unwrap_err();
            assert_eq!(err, TransportError::Io("connection reset".into()));
            assert_eq!(reader.read().await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn sink_failure_reaches_every_reader_as_write_error() {
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<Vec<u8>, TransportError>>(16);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(16);
        drop(outbound_rx);
        let sink =
            PollSender::new(outbound_tx).sink_map_err(|_| TransportError::Io("broken pipe".into()));
        let transport = ChannelDemuxer::start(
            ReceiverStream::new(inbound_rx),
            sink,
            &[Channel::Stdout, Channel::Stderr],
            16,
        );
        let (writer, mut readers, control) = transport.into_parts();

        writer.unwrap().send(Channel::Stdin, b"ls\n").await.unwrap();

        for reader in &mut readers {
            let err = reader.read().await.unwrap_err();
            assert_eq!(
                err,
                TransportError::WriteFailed(Box::new(TransportError::Io("broken pipe".into())))
            );
            assert_eq!(err.to_string(), "I/O error: broken pipe");
            assert_eq!(reader.read().await.unwrap(), None);
        }
        assert!(!control.is_open());
        drop(inbound_tx);
    }

    #[tokio::test]
    async fn close_stops_pumps_and_closes_sink() {
        let (transport, mut wire) = demux(&[Channel::Stdout]);
        let (writer, _readers, mut control) = transport.into_parts();
        assert!(control.is_open());

        control.close(Duration::from_secs(1)).await;

        assert!(!control.is_open());
        assert!(wire.outbound_rx.recv().await.is_none());
        let err = writer.unwrap().send(Channel::Stdin, b"x").await.unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }
}
