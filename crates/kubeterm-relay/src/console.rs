//! Local terminal as a session viewer.

use std::io::{self, IsTerminal, Read};

use async_trait::async_trait;
use crossterm::terminal;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::{Viewer, ViewerGone};

const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Renders session output on this process's stdout.
pub struct ConsoleViewer {
    out: Mutex<Stdout>,
}

impl ConsoleViewer {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }

    /// Current terminal size as `(rows, columns)`.
    pub fn size() -> (u16, u16) {
        let (cols, rows) = terminal::size().unwrap_or(FALLBACK_SIZE);
        (rows, cols)
    }

    async fn emit(&self, bytes: &[u8]) -> Result<(), ViewerGone> {
        let mut out = self.out.lock().await;
        out.write_all(bytes).await.map_err(|e| {
            debug!(error = %e, "Console write failed");
            ViewerGone
        })?;
        out.flush().await.map_err(|_| ViewerGone)
    }
}

impl Default for ConsoleViewer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Viewer for ConsoleViewer {
    async fn write(&self, text: &str) -> Result<(), ViewerGone> {
        self.emit(text.as_bytes()).await
    }

    async fn write_line(&self, text: &str) -> Result<(), ViewerGone> {
        self.emit(format!("\r\n{text}\r\n").as_bytes()).await
    }

    fn rows(&self) -> Result<u16, ViewerGone> {
        Ok(Self::size().0)
    }

    fn columns(&self) -> Result<u16, ViewerGone> {
        Ok(Self::size().1)
    }
}

/// Keeps the terminal in raw mode while alive.
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    /// Enter raw mode if stdin is a terminal. Failing to do so is not fatal.
    pub fn enter() -> Self {
        if !std::io::stdin().is_terminal() {
            return Self { enabled: false };
        }
        match terminal::enable_raw_mode() {
            Ok(()) => Self { enabled: true },
            Err(e) => {
                debug!(error = %e, "Could not enable raw mode");
                Self { enabled: false }
            }
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Read `input` on a dedicated OS thread and hand each chunk to the returned
/// receiver.
///
/// The read blocks outside the runtime, so runtime shutdown never waits on it.
/// The thread stops at its next read once `cancel` fires or the receiver is
/// dropped.
pub fn spawn_input_reader<R>(
    mut input: R,
    cancel: CancellationToken,
) -> io::Result<mpsc::Receiver<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    std::thread::Builder::new()
        .name("kubeterm-input".into())
        .spawn(move || {
            let mut buf = [0u8; 1024];
            while !cancel.is_cancelled() {
                match input.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(error = %e, "Reading input failed");
                        break;
                    }
                }
            }
            debug!("Input reader stopped");
        })?;
    Ok(rx)
}
