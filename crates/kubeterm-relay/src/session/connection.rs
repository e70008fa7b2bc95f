//! One relayed session: a remote transport, its reader tasks, the output
//! history and at most one attached viewer.
//!
//! Output ordering is guarded by the history mutex. Reader tasks hold it
//! while recording a chunk and forwarding it to the viewer; `attach` holds it
//! while swapping the viewer in and flushing the replay, so a newly attached
//! viewer always sees the replay before any live chunk.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kubeterm_core::RelayConfig;

use super::reader::{ReaderExit, run_reader};
use super::types::{ConnectionMode, ConnectionState, RelayError, SessionId, Target};
use super::viewer::{AttachedViewer, Viewer};
use crate::backend::{Backend, OpenRequest};
use crate::channel::Channel;
use crate::history::HistoryBuffer;
use crate::resize::ResizeCommand;
use crate::transport::{FrameWriter, TransportControl};

const ATTACHED: u64 = u64::MAX;

/// State shared between the connection handle and its reader tasks.
pub(crate) struct Shared {
    id: SessionId,
    mode: ConnectionMode,
    history: Mutex<HistoryBuffer>,
    viewer: ArcSwapOption<AttachedViewer>,
    cancel: CancellationToken,
    remote_lost: CancellationToken,
    terminated: AtomicBool,
    state: watch::Sender<ConnectionState>,
    created: Instant,
    // Millis since `created` at the last detach, `ATTACHED` while a viewer is attached.
    idle_since_ms: AtomicU64,
}

impl Shared {
    pub(crate) const fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record a chunk and forward it to the current viewer.
    pub(crate) async fn deliver(&self, text: &str) {
        let mut history = self.history.lock().await;
        history.append(text);
        if let Some(attached) = self.viewer.load_full()
            && let Err(e) = attached.0.write(text).await
        {
            debug!(session_id = %self.id, error = %e, "Viewer write failed");
        }
    }

    /// Record a status line and show it on the viewer.
    pub(crate) async fn record_line(&self, line: &str) {
        let mut history = self.history.lock().await;
        history.append(&format!("\r\n{line}\r\n"));
        if let Some(attached) = self.viewer.load_full()
            && let Err(e) = attached.0.write_line(line).await
        {
            debug!(session_id = %self.id, error = %e, "Viewer write failed");
        }
    }

    /// Called by a reader that saw the remote end, with the error line to
    /// record if it ended in failure. Only the first caller records a line
    /// and signals loss of the remote.
    pub(crate) async fn remote_terminated(&self, error_line: Option<&str>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        match error_line {
            None => {
                info!(session_id = %self.id, mode = %self.mode, "Remote closed the session");
                self.record_line(self.mode.closed_marker()).await;
            }
            Some(line) => self.record_line(line).await,
        }
        self.remote_lost.cancel();
    }

    fn mark_idle(&self) {
        let now = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(ATTACHED - 1);
        self.idle_since_ms.store(now, Ordering::Release);
    }
}

struct Live {
    writer: Option<FrameWriter>,
    control: TransportControl,
    supervisor: JoinHandle<()>,
}

enum Lifecycle {
    Uninitialized,
    Running(Live),
    Closed,
}

/// A relayed session.
pub struct Connection {
    shared: Arc<Shared>,
    target: Target,
    config: RelayConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Build an unopened connection. Performs no I/O.
    pub fn new(id: SessionId, target: Target, mode: ConnectionMode, config: RelayConfig) -> Self {
        let history = if mode.is_interactive() {
            HistoryBuffer::disabled()
        } else {
            HistoryBuffer::new(config.history_max_bytes)
        };
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            shared: Arc::new(Shared {
                id,
                mode,
                history: Mutex::new(history),
                viewer: ArcSwapOption::empty(),
                cancel: CancellationToken::new(),
                remote_lost: CancellationToken::new(),
                terminated: AtomicBool::new(false),
                state,
                created: Instant::now(),
                idle_since_ms: AtomicU64::new(0),
            }),
            target,
            config,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn mode(&self) -> ConnectionMode {
        self.shared.mode
    }

    pub const fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Resolves once a reader saw the remote end or fail.
    pub async fn remote_lost(&self) {
        self.shared.remote_lost.cancelled().await;
    }

    pub fn is_remote_lost(&self) -> bool {
        self.shared.remote_lost.is_cancelled()
    }

    /// Time since the viewer detached; `None` while one is attached.
    pub fn idle_for(&self) -> Option<Duration> {
        let since = self.shared.idle_since_ms.load(Ordering::Acquire);
        if since == ATTACHED {
            return None;
        }
        Some(
            self.shared
                .created
                .elapsed()
                .saturating_sub(Duration::from_millis(since)),
        )
    }

    /// Open the remote stream and start one reader per inbound channel.
    pub async fn open(&self, backend: &dyn Backend) -> Result<(), RelayError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Running(_) => return Err(RelayError::AlreadyOpened),
            Lifecycle::Closed => return Err(RelayError::Closed),
        }

        let request = OpenRequest {
            mode: self.shared.mode,
            target: self.target.clone(),
            command: self.target.resolved_command(&self.config.default_shell),
        };
        let transport = backend.open(&request).await.map_err(|e| {
            warn!(session_id = %self.shared.id, workload = %self.target, error = %e, "Failed to open session");
            RelayError::Open(e)
        })?;

        let (writer, readers, control) = transport.into_parts();
        let mut tasks = JoinSet::new();
        for reader in readers {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move {
                let channel = reader.channel();
                (channel, run_reader(shared, reader).await)
            });
        }
        let supervisor = tokio::spawn(supervise(Arc::clone(&self.shared), tasks));

        *lifecycle = Lifecycle::Running(Live {
            writer,
            control,
            supervisor,
        });
        self.shared.state.send_replace(ConnectionState::Running);
        info!(
            session_id = %self.shared.id,
            mode = %self.shared.mode,
            workload = %self.target,
            command = ?request.command,
            "Session opened"
        );
        Ok(())
    }

    /// Make `viewer` the sole receiver of output, replaying history first
    /// for non-interactive sessions.
    pub async fn attach(&self, viewer: Arc<dyn Viewer>) {
        let history = self.shared.history.lock().await;
        if self.shared.cancel.is_cancelled() {
            debug!(session_id = %self.shared.id, "Attach to closed session ignored");
            return;
        }
        let replay = (!self.shared.mode.is_interactive() && !history.is_empty())
            .then(|| history.snapshot());
        self.shared
            .viewer
            .store(Some(Arc::new(AttachedViewer(Arc::clone(&viewer)))));
        self.shared.idle_since_ms.store(ATTACHED, Ordering::Release);

        if let Some(snapshot) = replay {
            debug!(session_id = %self.shared.id, bytes = snapshot.len(), "Replaying history");
            if let Err(e) = viewer.write(&snapshot).await {
                debug!(session_id = %self.shared.id, error = %e, "Viewer write failed");
            }
        }
        drop(history);
        info!(session_id = %self.shared.id, "Viewer attached");
    }

    /// Drop the viewer. The session keeps running and buffering.
    pub fn detach(&self) {
        if self.shared.viewer.swap(None).is_some() {
            self.shared.mark_idle();
            info!(session_id = %self.shared.id, "Viewer detached");
        }
    }

    /// Forward viewer input to the remote. Log-only sessions ignore input.
    pub async fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if !self.shared.mode.has_input() {
            debug!(session_id = %self.shared.id, "Input ignored for read-only session");
            return;
        }
        let Some(writer) = self.writer(false).await else {
            debug!(session_id = %self.shared.id, "Input ignored, session not running");
            return;
        };
        if let Err(e) = writer.send(Channel::Stdin, bytes).await {
            warn!(session_id = %self.shared.id, error = %e, "Stream write failed");
            self.shared
                .record_line(&format!("Error writing to stream: {e}"))
                .await;
        }
    }

    pub async fn write_byte(&self, byte: u8) {
        self.write(&[byte]).await;
    }

    /// Send a resize command if the transport is open.
    pub async fn resize(&self, rows: u16, cols: u16) {
        let Some(writer) = self.writer(true).await else {
            return;
        };
        let frame = match ResizeCommand::new(rows, cols).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %self.shared.id, error = %e, "Failed to encode resize");
                return;
            }
        };
        if let Err(e) = writer.send_frame(frame).await {
            warn!(session_id = %self.shared.id, rows, cols, error = %e, "Resize failed");
        } else {
            debug!(session_id = %self.shared.id, rows, cols, "Resize sent");
        }
    }

    /// Nudge a full-screen program into repainting by shrinking the terminal
    /// one row and restoring it.
    pub async fn force_redraw(&self) {
        if !self.shared.mode.is_interactive() {
            return;
        }
        let Some(attached) = self.shared.viewer.load_full() else {
            return;
        };
        let (Ok(rows), Ok(cols)) = (attached.0.rows(), attached.0.columns()) else {
            debug!(session_id = %self.shared.id, "Viewer gone, redraw skipped");
            return;
        };
        if self.writer(true).await.is_none() {
            return;
        }
        self.resize(rows.saturating_sub(1), cols).await;
        tokio::time::sleep(self.config.redraw_delay()).await;
        self.resize(rows, cols).await;
    }

    /// Stop readers, close the transport and release everything. Idempotent.
    pub async fn close(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Closed)
        };
        if matches!(previous, Lifecycle::Closed) {
            return;
        }

        {
            let _history = self.shared.history.lock().await;
            self.shared.cancel.cancel();
            self.shared.viewer.store(None);
        }
        self.shared.state.send_replace(ConnectionState::Closed);

        if let Lifecycle::Running(mut live) = previous {
            let timeout = self.config.close_timeout();
            drop(live.writer.take());
            live.control.close(timeout).await;
            if tokio::time::timeout(timeout, &mut live.supervisor)
                .await
                .is_err()
            {
                warn!(session_id = %self.shared.id, "Readers did not stop in time, aborting");
                live.supervisor.abort();
            }
        }
        info!(session_id = %self.shared.id, "Session closed");
    }

    /// Close the session if it has had no viewer for at least `idle_timeout`.
    /// Returns how long it was idle when closed.
    ///
    /// The check and the start of the close happen under the history lock, so
    /// a concurrent `attach` either keeps the session alive or is ignored.
    pub async fn close_if_idle(&self, idle_timeout: Duration) -> Option<Duration> {
        let idle = {
            let _history = self.shared.history.lock().await;
            let idle = self.idle_for().filter(|idle| *idle >= idle_timeout)?;
            self.shared.cancel.cancel();
            idle
        };
        self.close().await;
        Some(idle)
    }

    async fn writer(&self, require_open: bool) -> Option<FrameWriter> {
        let lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Running(live) if !require_open || live.control.is_open() => {
                live.writer.clone()
            }
            _ => None,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        if let Lifecycle::Running(live) = self.lifecycle.get_mut() {
            live.control.cancel();
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut readers: JoinSet<(Channel, ReaderExit)>) {
    while let Some(joined) = readers.join_next().await {
        match joined {
            Ok((channel, ReaderExit::Failed(reason))) => {
                warn!(session_id = %shared.id, %channel, reason, "Reader exited with error");
            }
            Ok((channel, exit)) => {
                debug!(session_id = %shared.id, %channel, ?exit, "Reader exited");
            }
            Err(e) if e.is_panic() => {
                error!(session_id = %shared.id, error = %e, "Reader task panicked");
                shared
                    .record_line("Error reading stream: reader task panicked")
                    .await;
            }
            Err(e) => {
                debug!(session_id = %shared.id, error = %e, "Reader task aborted");
            }
        }
    }
    debug!(session_id = %shared.id, "All readers finished");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_helpers::{MockBackend, RecordingViewer, settle};
    use crate::transport::TransportError;

    fn connection(mode: ConnectionMode) -> Connection {
        Connection::new(
            SessionId::new_v4(),
            Target::new("default", "p1"),
            mode,
            RelayConfig::default(),
        )
    }

    #[tokio::test]
    async fn new_connection_is_uninitialized_and_idle() {
        let conn = connection(ConnectionMode::CombinedLogs);
        assert_eq!(conn.state(), ConnectionState::Uninitialized);
        assert!(conn.idle_for().is_some());
        assert!(!conn.is_remote_lost());
    }

    #[tokio::test]
    async fn replay_is_flushed_once_in_a_single_write() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::CombinedLogs);
        conn.open(&backend).await.unwrap();
        let remote = backend.remote().await;

        for chunk in ["ab", "c\nde", "f\n"] {
            remote.stdout(chunk).await;
        }
        settle().await;

        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;

        assert_eq!(viewer.writes(), vec!["abc\ndef\n".to_string()]);
    }

    #[tokio::test]
    async fn tail_only_history_is_replayed() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::StdoutOnly);
        conn.open(&backend).await.unwrap();
        backend.remote().await.stdout("$ ").await;
        settle().await;

        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;
        assert_eq!(viewer.writes(), vec!["$ ".to_string()]);
    }

    #[tokio::test]
    async fn interactive_sessions_do_not_replay() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::Interactive);
        conn.open(&backend).await.unwrap();
        backend.remote().await.stdout("prompt$ ").await;
        settle().await;

        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;
        assert!(viewer.writes().is_empty());
        assert!(conn.shared.history.lock().await.is_empty());
    }

    #[tokio::test]
    async fn live_chunks_are_forwarded_and_recorded_once() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::CombinedLogs);
        conn.open(&backend).await.unwrap();
        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;

        let remote = backend.remote().await;
        remote.stdout("one\n").await;
        remote.stderr("two\n").await;
        settle().await;

        let mut writes = viewer.writes();
        writes.sort();
        assert_eq!(writes, vec!["one\n".to_string(), "two\n".to_string()]);
        let snapshot = conn.shared.history.lock().await.snapshot();
        assert_eq!(snapshot.matches("one\n").count(), 1);
        assert_eq!(snapshot.matches("two\n").count(), 1);
    }

    #[tokio::test]
    async fn detached_output_is_buffered_for_next_viewer() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::CombinedLogs);
        conn.open(&backend).await.unwrap();
        let remote = backend.remote().await;

        let first = RecordingViewer::new(24, 80);
        conn.attach(first.clone()).await;
        remote.stdout("seen\n").await;
        settle().await;
        conn.detach();
        assert!(conn.idle_for().is_some());

        remote.stdout("missed\n").await;
        settle().await;
        assert_eq!(first.writes(), vec!["seen\n".to_string()]);

        let second = RecordingViewer::new(24, 80);
        conn.attach(second.clone()).await;
        assert_eq!(second.writes(), vec!["seen\nmissed\n".to_string()]);
        assert!(conn.idle_for().is_none());
    }

    #[tokio::test]
    async fn gone_viewer_does_not_stop_the_relay() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::CombinedLogs);
        conn.open(&backend).await.unwrap();
        let viewer = RecordingViewer::new(24, 80);
        viewer.set_gone();
        conn.attach(viewer).await;

        backend.remote().await.stdout("still recorded\n").await;
        settle().await;
        assert_eq!(
            conn.shared.history.lock().await.snapshot(),
            "still recorded\n"
        );
    }

    #[tokio::test]
    async fn opening_twice_fails() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::Interactive);
        conn.open(&backend).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Running);
        assert!(matches!(
            conn.open(&backend).await,
            Err(RelayError::AlreadyOpened)
        ));
    }

    #[tokio::test]
    async fn open_after_close_fails() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::Interactive);
        conn.close().await;
        assert!(matches!(conn.open(&backend).await, Err(RelayError::Closed)));
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test]
    async fn open_failure_is_returned() {
        let backend = MockBackend::new();
        backend.fail_with(TransportError::Rejected {
            status: 404,
            message: "pods \"p1\" not found".into(),
        });
        let conn = connection(ConnectionMode::Interactive);

        let err = conn.open(&backend).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Open(TransportError::Rejected { status: 404, .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn writes_in_log_modes_are_ignored() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::CombinedLogs);
        conn.open(&backend).await.unwrap();

        conn.write(b"ls\n").await;
        conn.write_byte(b'q').await;

        let remote = backend.remote().await;
        assert!(remote.try_next_outbound().is_none());
    }

    #[tokio::test]
    async fn write_before_open_is_ignored() {
        let conn = connection(ConnectionMode::Interactive);
        conn.write(b"ls\n").await;
        assert!(conn.shared.history.lock().await.is_empty());
    }

    #[tokio::test]
    async fn stream_end_yields_one_marker_for_two_channels() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::CombinedLogs);
        conn.open(&backend).await.unwrap();
        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;

        backend.remote().await.hang_up().await;
        conn.remote_lost().await;
        settle().await;

        assert_eq!(viewer.lines(), vec!["Connection closed.".to_string()]);
        let snapshot = conn.shared.history.lock().await.snapshot();
        assert_eq!(snapshot, "\r\nConnection closed.\r\n");
        assert_eq!(conn.state(), ConnectionState::Running);
    }

    #[tokio::test]
    async fn log_follow_end_uses_log_marker() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::FollowLogs);
        conn.open(&backend).await.unwrap();
        let remote = backend.remote().await;
        remote.stdout("last line\n").await;
        remote.hang_up().await;

        conn.remote_lost().await;
        let snapshot = conn.shared.history.lock().await.snapshot();
        assert_eq!(snapshot, "last line\n\r\nLog stream closed.\r\n");
    }

    #[tokio::test]
    async fn read_error_is_recorded() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::StdoutOnly);
        conn.open(&backend).await.unwrap();
        backend
            .remote()
            .await
            .fail(TransportError::Io("connection reset".into()))
            .await;

        conn.remote_lost().await;
        let snapshot = conn.shared.history.lock().await.snapshot();
        assert_eq!(
            snapshot,
            "\r\nError reading stream: I/O error: connection reset\r\n"
        );
    }

    #[tokio::test]
    async fn intentional_close_records_nothing() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::CombinedLogs);
        conn.open(&backend).await.unwrap();
        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;

        conn.close().await;
        settle().await;

        assert!(viewer.lines().is_empty());
        assert!(conn.shared.history.lock().await.is_empty());
        assert!(!conn.is_remote_lost());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_concurrent_safe() {
        let backend = MockBackend::new();
        let conn = Arc::new(connection(ConnectionMode::Interactive));
        conn.open(&backend).await.unwrap();

        let a = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.close().await }
        });
        let b = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.close().await }
        });
        a.await.unwrap();
        b.await.unwrap();
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(backend.remote().await.sink_closed().await);
    }

    #[tokio::test]
    async fn write_after_remote_loss_is_recorded() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::Interactive);
        conn.open(&backend).await.unwrap();
        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;

        backend.remote().await.hang_up().await;
        conn.remote_lost().await;
        settle().await;
        conn.write(b"ls\n").await;

        assert_eq!(
            viewer.lines(),
            vec![
                "Connection closed.".to_string(),
                "Error writing to stream: Transport closed".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn failed_wire_write_is_recorded_as_write_error() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::Interactive);
        conn.open(&backend).await.unwrap();
        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;

        backend
            .remote()
            .await
            .break_writes(TransportError::Io("broken pipe".into()));
        conn.write(b"ls\n").await;
        conn.remote_lost().await;
        settle().await;

        assert_eq!(
            viewer.lines(),
            vec!["Error writing to stream: I/O error: broken pipe".to_string()]
        );
        assert_eq!(conn.state(), ConnectionState::Running);
    }

    #[tokio::test]
    async fn resize_is_skipped_once_transport_closed() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::Interactive);
        conn.resize(24, 80).await;

        conn.open(&backend).await.unwrap();
        let remote = backend.remote().await;
        remote.hang_up().await;
        conn.remote_lost().await;
        settle().await;

        conn.resize(30, 100).await;
        assert!(remote.try_next_outbound().is_none());
    }

    #[tokio::test]
    async fn force_redraw_shrinks_then_restores() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::Interactive);
        conn.open(&backend).await.unwrap();
        conn.attach(RecordingViewer::new(24, 80)).await;

        conn.force_redraw().await;

        let remote = backend.remote().await;
        assert_eq!(
            remote.next_outbound().await,
            ResizeCommand::new(23, 80).encode().unwrap()
        );
        assert_eq!(
            remote.next_outbound().await,
            ResizeCommand::new(24, 80).encode().unwrap()
        );
    }

    #[tokio::test]
    async fn force_redraw_follows_viewer_size_changes() {
        let backend = MockBackend::new();
        let conn = connection(ConnectionMode::Interactive);
        conn.open(&backend).await.unwrap();
        let viewer = RecordingViewer::new(24, 80);
        conn.attach(viewer.clone()).await;

        viewer.set_size(40, 120);
        conn.force_redraw().await;

        let remote = backend.remote().await;
        assert_eq!(
            remote.next_outbound().await,
            ResizeCommand::new(39, 120).encode().unwrap()
        );
        assert_eq!(
            remote.next_outbound().await,
            ResizeCommand::new(40, 120).encode().unwrap()
        );
    }

    #[tokio::test]
    async fn attach_after_close_leaves_no_viewer() {
        let conn = connection(ConnectionMode::CombinedLogs);
        conn.close().await;
        conn.attach(RecordingViewer::new(24, 80)).await;
        assert!(conn.shared.viewer.load().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn attach_racing_close_never_leaves_a_viewer() {
        let backend = MockBackend::new();
        for _ in 0..50 {
            let conn = Arc::new(connection(ConnectionMode::CombinedLogs));
            conn.open(&backend).await.unwrap();

            let attach = tokio::spawn({
                let conn = Arc::clone(&conn);
                async move { conn.attach(RecordingViewer::new(24, 80)).await }
            });
            let close = tokio::spawn({
                let conn = Arc::clone(&conn);
                async move { conn.close().await }
            });
            attach.await.unwrap();
            close.await.unwrap();

            assert_eq!(conn.state(), ConnectionState::Closed);
            assert!(conn.shared.viewer.load().is_none());
        }
    }

    #[tokio::test]
    async fn force_redraw_needs_interactive_and_viewer() {
        let backend = MockBackend::new();
        let logs = connection(ConnectionMode::CombinedLogs);
        logs.open(&backend).await.unwrap();
        logs.attach(RecordingViewer::new(24, 80)).await;
        logs.force_redraw().await;

        let shell = connection(ConnectionMode::Interactive);
        shell.open(&backend).await.unwrap();
        shell.force_redraw().await;

        for remote in backend.remotes().await {
            assert!(remote.try_next_outbound().is_none());
        }
    }
}
