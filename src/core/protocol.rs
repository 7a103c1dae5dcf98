//! Length-prefixed JSON frames exchanged between the host and a container's
//! init process.
//!
//! Each frame is a 4-byte big-endian payload length followed by the payload.
//! The host reads its non-blocking end through a [`FrameReader`], so partial
//! reads and several frames arriving in one read never desynchronize it.

use crate::config::types::{IsolateError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const HEADER_LEN: usize = 4;

/// Everything init ever says to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitMessage {
    /// Static setup done; init now blocks on the command pipe. `warnings`
    /// lists hardening steps skipped in permissive mode.
    Ready {
        warnings: Vec<String>,
    },
    SetupFailed {
        reason: String,
    },
    /// The program and every descendant are gone.
    Finished {
        request_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        reaped_descendants: u32,
    },
    /// The program could not be started at all.
    LaunchFailed {
        request_id: String,
        reason: String,
    },
}

pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(IsolateError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte maximum",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one whole frame. `write_all` retries `EINTR` itself.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let frame = encode_frame(value)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Blocking read of one frame. `Ok(None)` on end of stream at a frame
/// boundary; end of stream inside a frame is a protocol error.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; HEADER_LEN];
    if !fill_exact(reader, &mut header, true)? {
        return Ok(None);
    }

    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    fill_exact(reader, &mut payload, false)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Returns false only when `allow_eof` and the stream ended before any byte.
fn fill_exact<R: Read>(reader: &mut R, buf: &mut [u8], allow_eof: bool) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 && allow_eof => return Ok(false),
            Ok(0) => {
                return Err(IsolateError::Protocol(format!(
                    "stream ended after {} of {} bytes",
                    filled,
                    buf.len()
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn frame_len(header: [u8; HEADER_LEN]) -> Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IsolateError::Protocol(format!(
            "announced frame length {} exceeds the {} byte maximum",
            len, MAX_FRAME_LEN
        )));
    }
    Ok(len)
}

/// Result of draining a non-blocking source into a [`FrameReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fill {
    pub bytes: usize,
    pub eof: bool,
}

/// Accumulates bytes from a non-blocking pipe and hands out whole frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Read until the source would block or reports end of stream.
    pub fn fill_from<R: Read>(&mut self, source: &mut R) -> Result<Fill> {
        let mut chunk = [0u8; 4096];
        let mut fill = Fill {
            bytes: 0,
            eof: false,
        };
        loop {
            match source.read(&mut chunk) {
                Ok(0) => {
                    fill.eof = true;
                    return Ok(fill);
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    fill.bytes += n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(fill),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buffer[..HEADER_LEN]);
        let len = frame_len(header)?;
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..HEADER_LEN + len).collect();
        Ok(Some(serde_json::from_slice(&frame[HEADER_LEN..])?))
    }
}
