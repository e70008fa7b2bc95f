//! Per-channel reader tasks.

use std::sync::Arc;

use tracing::{debug, warn};

use super::connection::Shared;
use crate::transport::{ChannelReader, TransportError};

/// How a reader task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The remote closed the channel.
    EndOfStream,
    /// The transport failed.
    Failed(String),
    /// The session was closed locally.
    Cancelled,
}

/// Decodes a byte stream as UTF-8, carrying sequences split across chunks.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode everything up to the last complete character. Invalid bytes
    /// become U+FFFD.
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_suffix_len(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush whatever is left at end of stream.
    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

// Length of a trailing multi-byte sequence that is still missing bytes.
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    for (back, &byte) in bytes.iter().rev().take(3).enumerate() {
        let seen = back + 1;
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > seen { seen } else { 0 };
    }
    0
}

pub(crate) async fn run_reader(shared: Arc<Shared>, mut reader: ChannelReader) -> ReaderExit {
    let channel = reader.channel();
    let mut decoder = Utf8Decoder::default();
    let cancel = shared.cancel_token();

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return ReaderExit::Cancelled,
            item = reader.read() => item,
        };

        match item {
            Ok(Some(chunk)) => {
                let text = decoder.decode(&chunk);
                if !text.is_empty() {
                    debug!(session_id = %shared.id(), %channel, bytes = chunk.len(), "Output chunk");
                    shared.deliver(&text).await;
                }
            }
            Ok(None) => {
                if cancel.is_cancelled() {
                    return ReaderExit::Cancelled;
                }
                let rest = decoder.finish();
                if !rest.is_empty() {
                    shared.deliver(&rest).await;
                }
                shared.remote_terminated(None).await;
                return ReaderExit::EndOfStream;
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    return ReaderExit::Cancelled;
                }
                let reason = e.to_string();
                let line = if matches!(e, TransportError::WriteFailed(_)) {
                    format!("Error writing to stream: {reason}")
                } else {
                    warn!(session_id = %shared.id(), %channel, error = %e, "Stream read failed");
                    format!("Error reading stream: {reason}")
                };
                shared.remote_terminated(Some(&line)).await;
                return ReaderExit::Failed(reason);
            }
        }
    }
}
