//! Resize command encoding for the control channel.

use serde::Serialize;

use crate::channel::{Channel, encode_frame};

/// Terminal dimensions as the remote expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResizeCommand {
    #[serde(rename = "Height")]
    pub rows: u16,
    #[serde(rename = "Width")]
    pub cols: u16,
}

impl ResizeCommand {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Build the full frame: channel byte 4 followed by
    /// `{"Height":rows,"Width":cols}`.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let payload = serde_json::to_vec(self)?;
        Ok(encode_frame(Channel::Resize, &payload))
    }
}
