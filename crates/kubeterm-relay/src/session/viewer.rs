//! The rendering surface a session forwards output to.

use std::sync::Arc;

use async_trait::async_trait;

/// The viewer went away (tab closed, drawer undocked). Always swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Viewer is gone")]
pub struct ViewerGone;

/// A terminal view that can render text and report its size.
#[async_trait]
pub trait Viewer: Send + Sync {
    /// Render `text` verbatim.
    async fn write(&self, text: &str) -> Result<(), ViewerGone>;

    /// Render `text` on a line of its own.
    async fn write_line(&self, text: &str) -> Result<(), ViewerGone>;

    fn rows(&self) -> Result<u16, ViewerGone>;

    fn columns(&self) -> Result<u16, ViewerGone>;
}

// Wrapper so the trait object can live in an `ArcSwapOption`.
pub(crate) struct AttachedViewer(pub(crate) Arc<dyn Viewer>);
