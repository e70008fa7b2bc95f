//! Channel addressing and frame encoding for multiplexed pod streams.
//!
//! Every frame on the wire is one binary message whose first byte is the
//! channel id and whose remaining bytes are the payload:
//!
//! ```text
//! [channel][payload ...]
//! ```

use std::fmt;

/// Logical stream carried over one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Input to the remote process (relay → remote).
    Stdin = 0,
    /// Remote standard output.
    Stdout = 1,
    /// Remote standard error.
    Stderr = 2,
    /// Remote process exit status as JSON (remote → relay).
    Status = 3,
    /// Terminal resize commands (relay → remote).
    Resize = 4,
}

impl Channel {
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            3 => Some(Self::Status),
            4 => Some(Self::Resize),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Status => "status",
            Self::Resize => "resize",
        };
        f.write_str(name)
    }
}

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown channel id: {0}")]
    UnknownChannel(u8),
}

/// Prefix `payload` with the channel byte.
pub fn encode_frame(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(channel.id());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into its channel and payload.
pub fn decode_frame(frame: &[u8]) -> Result<(Channel, &[u8]), FrameError> {
    let (&id, payload) = frame.split_first().ok_or(FrameError::Empty)?;
    let channel = Channel::from_id(id).ok_or(FrameError::UnknownChannel(id))?;
    Ok((channel, payload))
}
