//! Wire messages for the supervisor's RPC surface.
//!
//! Messages are length-prefixed JSON: a u32 big-endian payload length
//! followed by the serialized value. The same framing runs on both the
//! front-end socket and the app's API socket (fd 3). The capability-RPC
//! system proper is an external collaborator; these frames are its
//! stand-in interface.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

/// Length prefix size: 4 bytes, u32 big-endian.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Upper bound on a single frame, to keep a malicious peer from ballooning
/// our memory.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Requests a front-end may issue against the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Postpone the idle-shutdown timer. Cheap, idempotent.
    KeepAlive,
    /// Kill the app and exit immediately.
    Shutdown,
    /// Fetch the app's main UI view.
    GetMainView,
    /// Current estimated grain size in bytes.
    GetGrainSize,
    /// Resolve once the estimate differs from `old_size` (with a settling
    /// delay to coalesce bursts).
    GetGrainSizeWhenDifferent { old_size: u64 },
}

/// Supervisor replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    GrainSize { size: u64 },
    MainView { view: serde_json::Value },
    Error { message: String },
}

/// Requests the supervisor sends to the app over fd 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Restore the null sturdy-ref: hand over the main UI view.
    RestoreMainView,
}

/// App replies on fd 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ApiResponse {
    MainView { view: serde_json::Value },
}

/// Serializes `msg` into one frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg).context("failed to serialize message")?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        bail!("outgoing frame too large: {} bytes", payload.len());
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Deserializes one frame payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).context("failed to deserialize message")
}

/// Incremental frame splitter for a non-blocking stream.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Splits off the next complete frame payload, if one has arrived.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len > MAX_FRAME_SIZE {
            bail!("incoming frame too large: {len} bytes");
        }
        let total = LENGTH_PREFIX_SIZE + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[LENGTH_PREFIX_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }
}

/// Blocking request/response exchange, used by the single-instance gate.
/// The caller is expected to have set read/write timeouts on the stream.
pub fn call_blocking(stream: &mut UnixStream, request: &Request) -> Result<Response> {
    let frame = encode_frame(request)?;
    stream.write_all(&frame).context("failed to send request")?;

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    stream
        .read_exact(&mut prefix)
        .context("failed to read response length")?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        bail!("response frame too large: {len} bytes");
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .context("failed to read response payload")?;
    decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_arbitrary_read_boundaries() {
        let frame = encode_frame(&Request::GetGrainSizeWhenDifferent { old_size: 42 }).unwrap();
        let mut reader = FrameReader::new();
        for byte in &frame[..frame.len() - 1] {
            reader.extend(std::slice::from_ref(byte));
            assert!(reader.next_frame().unwrap().is_none());
        }
        reader.extend(std::slice::from_ref(frame.last().unwrap()));
        let payload = reader.next_frame().unwrap().unwrap();
        let decoded: Request = decode(&payload).unwrap();
        assert_eq!(decoded, Request::GetGrainSizeWhenDifferent { old_size: 42 });
    }

    #[test]
    fn back_to_back_frames_are_separated() {
        let mut reader = FrameReader::new();
        reader.extend(&encode_frame(&Request::KeepAlive).unwrap());
        reader.extend(&encode_frame(&Request::Shutdown).unwrap());
        let first: Request = decode(&reader.next_frame().unwrap().unwrap()).unwrap();
        let second: Request = decode(&reader.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(first, Request::KeepAlive);
        assert_eq!(second, Request::Shutdown);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut reader = FrameReader::new();
        reader.extend(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        assert!(reader.next_frame().is_err());
    }
}
