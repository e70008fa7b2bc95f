//! In-memory backend and viewer for tests.
//!
//! [`MockBackend`] hands out transports backed by channels; every opened
//! transport has a [`MockRemote`] that plays the cluster side.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, future, stream};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::backend::{Backend, OpenRequest};
use crate::channel::{Channel, encode_frame};
use crate::session::{ConnectionMode, Viewer, ViewerGone};
use crate::transport::{ChannelDemuxer, Transport, TransportError};

type Inbound = Option<Result<Vec<u8>, TransportError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Give spawned reader and pump tasks time to drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// The cluster side of one mock transport.
#[derive(Clone)]
pub struct MockRemote {
    inbound: mpsc::Sender<Inbound>,
    outbound: Option<Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>>,
    write_failure: Arc<Mutex<Option<TransportError>>>,
    framed: bool,
}

impl MockRemote {
    pub async fn stdout(&self, text: &str) {
        self.send(Channel::Stdout, text.as_bytes()).await;
    }

    pub async fn stderr(&self, text: &str) {
        self.send(Channel::Stderr, text.as_bytes()).await;
    }

    /// Send bytes on `channel`. Log streams are unframed, so the channel is
    /// ignored for them.
    pub async fn send(&self, channel: Channel, bytes: &[u8]) {
        let payload = if self.framed {
            encode_frame(channel, bytes)
        } else {
            bytes.to_vec()
        };
        self.send_raw(payload).await;
    }

    /// Send one frame exactly as given.
    pub async fn send_raw(&self, frame: Vec<u8>) {
        let _ = self.inbound.send(Some(Ok(frame))).await;
    }

    /// Fail the transport read side.
    pub async fn fail(&self, error: TransportError) {
        let _ = self.inbound.send(Some(Err(error))).await;
    }

    /// Make every following write of the relay fail on the wire.
    pub fn break_writes(&self, error: TransportError) {
        *lock(&self.write_failure) = Some(error);
    }

    /// End the inbound stream after everything already sent.
    pub async fn hang_up(&self) {
        let _ = self.inbound.send(None).await;
    }

    /// Next frame written by the relay.
    pub async fn next_outbound(&self) -> Vec<u8> {
        let outbound = self.outbound.as_ref().expect("log streams have no outbound side");
        let mut rx = outbound.lock().await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no outbound frame within 1s")
            .expect("outbound side closed")
    }

    /// A frame written by the relay, if one is queued right now.
    pub fn try_next_outbound(&self) -> Option<Vec<u8>> {
        let outbound = self.outbound.as_ref()?;
        outbound.try_lock().ok()?.try_recv().ok()
    }

    /// Whether the relay closed its write side (drains pending frames).
    pub async fn sink_closed(&self) -> bool {
        let Some(outbound) = &self.outbound else {
            return true;
        };
        let mut rx = outbound.lock().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while rx.recv().await.is_some() {}
        })
        .await
        .is_ok()
    }
}

/// Backend whose transports are plain channels.
#[derive(Default)]
pub struct MockBackend {
    requests: Mutex<Vec<OpenRequest>>,
    failure: Mutex<Option<TransportError>>,
    remotes: Mutex<Vec<MockRemote>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `open` fail with `error`.
    pub fn fail_with(&self, error: TransportError) {
        *lock(&self.failure) = Some(error);
    }

    pub fn open_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<OpenRequest> {
        lock(&self.requests).clone()
    }

    /// The remote of the most recently opened transport.
    pub async fn remote(&self) -> MockRemote {
        loop {
            if let Some(remote) = lock(&self.remotes).last().cloned() {
                return remote;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Remotes of every transport opened so far, oldest first.
    pub async fn remotes(&self) -> Vec<MockRemote> {
        tokio::task::yield_now().await;
        lock(&self.remotes).clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn open(&self, request: &OpenRequest) -> Result<Transport, TransportError> {
        lock(&self.requests).push(request.clone());
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }

        let capacity = 64;
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(capacity);
        let inbound = stream::unfold(inbound_rx, |mut rx| async move {
            match rx.recv().await {
                Some(Some(item)) => Some((item, rx)),
                _ => None,
            }
        });

        let write_failure = Arc::new(Mutex::new(None::<TransportError>));

        let (transport, remote) = if request.mode == ConnectionMode::FollowLogs {
            let transport = Transport::from_stream(Channel::Stdout, inbound, capacity);
            let remote = MockRemote {
                inbound: inbound_tx,
                outbound: None,
                write_failure,
                framed: false,
            };
            (transport, remote)
        } else {
            let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
            let failure = Arc::clone(&write_failure);
            let sink = PollSender::new(outbound_tx)
                .sink_map_err(|_| TransportError::Closed)
                .with(move |frame: Vec<u8>| {
                    future::ready(lock(&failure).clone().map_or(Ok(frame), Err))
                });
            let transport = ChannelDemuxer::start(
                inbound,
                sink,
                request.mode.inbound_channels(),
                capacity,
            );
            let remote = MockRemote {
                inbound: inbound_tx,
                outbound: Some(Arc::new(tokio::sync::Mutex::new(outbound_rx))),
                write_failure,
                framed: true,
            };
            (transport, remote)
        };

        lock(&self.remotes).push(remote);
        Ok(transport)
    }
}

/// Viewer that records everything it is given.
pub struct RecordingViewer {
    writes: Mutex<Vec<String>>,
    lines: Mutex<Vec<String>>,
    rows: AtomicU16,
    columns: AtomicU16,
    gone: AtomicBool,
}

impl RecordingViewer {
    pub fn new(rows: u16, columns: u16) -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            lines: Mutex::new(Vec::new()),
            rows: AtomicU16::new(rows),
            columns: AtomicU16::new(columns),
            gone: AtomicBool::new(false),
        })
    }

    pub fn writes(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    /// All `write` calls concatenated.
    pub fn output(&self) -> String {
        lock(&self.writes).concat()
    }

    pub fn set_size(&self, rows: u16, columns: u16) {
        self.rows.store(rows, Ordering::Relaxed);
        self.columns.store(columns, Ordering::Relaxed);
    }

    /// Make every following call fail with [`ViewerGone`].
    pub fn set_gone(&self) {
        self.gone.store(true, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), ViewerGone> {
        if self.gone.load(Ordering::Relaxed) {
            Err(ViewerGone)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Viewer for RecordingViewer {
    async fn write(&self, text: &str) -> Result<(), ViewerGone> {
        self.check()?;
        lock(&self.writes).push(text.to_string());
        Ok(())
    }

    async fn write_line(&self, text: &str) -> Result<(), ViewerGone> {
        self.check()?;
        lock(&self.lines).push(text.to_string());
        Ok(())
    }

    fn rows(&self) -> Result<u16, ViewerGone> {
        self.check()?;
        Ok(self.rows.load(Ordering::Relaxed))
    }

    fn columns(&self) -> Result<u16, ViewerGone> {
        self.check()?;
        Ok(self.columns.load(Ordering::Relaxed))
    }
}
