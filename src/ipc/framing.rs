//! Length-prefixed JSON framing for the worker socket.
//!
//! # Wire Format
//!
//! ```text
//! <i32 little-endian length><length bytes of UTF-8 JSON>
//! ```
//!
//! The same envelope is used in both directions. One request is in flight
//! at a time: the worker answers strictly in order and never pipelines.
//!
//! # Deadlines
//!
//! A render budget covers the whole round trip. Every blocking step (each
//! write, each partial read) is bounded by what is left of that budget, so
//! a peer trickling bytes cannot stretch a call beyond its timeout.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::error::IpcError;
use crate::models::{RenderRequest, RenderResponse};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest frame accepted in either direction (256MB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Remaining time for one round trip. `None` means no deadline.
#[derive(Debug, Clone, Copy)]
struct Budget {
    timeout: Option<Duration>,
    started: Instant,
}

impl Budget {
    fn start(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            started: Instant::now(),
        }
    }

    /// Time left, or `RenderTimeout` once the budget is spent.
    fn remaining(&self) -> Result<Option<Duration>, IpcError> {
        let Some(limit) = self.timeout else {
            return Ok(None);
        };
        match limit.checked_sub(self.started.elapsed()) {
            Some(left) if !left.is_zero() => Ok(Some(left)),
            _ => Err(IpcError::RenderTimeout(limit)),
        }
    }

    /// Run one blocking step bounded by the remaining budget.
    async fn bound<T, F>(&self, step: F) -> Result<T, IpcError>
    where
        F: Future<Output = io::Result<T>>,
    {
        match self.remaining()? {
            None => Ok(step.await?),
            Some(left) => match timeout(left, step).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(IpcError::RenderTimeout(self.timeout.unwrap_or(left))),
            },
        }
    }
}

/// Write one frame: length prefix, then payload, then flush.
///
/// Without a deadline; see [`FramedChannel`] for the bounded variant.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let prefix = encode_prefix(payload.len())?;
    writer.write_all(&prefix).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

fn encode_prefix(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE], IpcError> {
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len as i64));
    }
    let len = i32::try_from(len).map_err(|_| IpcError::FrameTooLarge(len as i64))?;
    Ok(len.to_le_bytes())
}

fn decode_prefix(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize, IpcError> {
    let declared = i32::from_le_bytes(prefix);
    match usize::try_from(declared) {
        Ok(len) if len <= MAX_FRAME_SIZE => Ok(len),
        _ => Err(IpcError::FrameTooLarge(i64::from(declared))),
    }
}

/// Fill `buf` completely, one partial read at a time, within `budget`.
async fn read_exact_within<R>(reader: &mut R, buf: &mut [u8], budget: &Budget) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = budget.bound(reader.read(&mut buf[filled..])).await?;
        if n == 0 {
            return Err(IpcError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(())
}

/// Request/response channel over a connected worker stream.
///
/// The receive buffer is kept across calls and only grows, sized to the
/// largest response seen so far.
#[derive(Debug)]
pub struct FramedChannel<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Current receive buffer size (high-water mark of response lengths).
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Send one render request and wait for its response.
    ///
    /// `timeout` bounds the whole round trip; `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// - `RenderTimeout` if the budget runs out at any step
    /// - `ConnectionClosed` if the worker hangs up mid-frame
    /// - `FrameTooLarge` for an out-of-range length prefix
    /// - `MalformedResponse` if the body is not a recognised response
    pub async fn render(
        &mut self,
        request: &RenderRequest,
        timeout: Option<Duration>,
    ) -> Result<RenderResponse, IpcError> {
        let budget = Budget::start(timeout);
        let payload = serde_json::to_vec(request)?;

        self.send_within(&payload, &budget).await?;
        debug!("Sent render request ({} bytes)", payload.len());

        let body = self.receive_within(&budget).await?;
        debug!("Received render response ({} bytes)", body.len());

        RenderResponse::decode(body)
    }

    /// Send a raw frame under `timeout`.
    pub async fn send_request(&mut self, payload: &[u8], timeout: Option<Duration>) -> Result<(), IpcError> {
        self.send_within(payload, &Budget::start(timeout)).await
    }

    /// Receive a raw frame under `timeout`; the slice borrows the channel buffer.
    pub async fn receive_response(&mut self, timeout: Option<Duration>) -> Result<&[u8], IpcError> {
        self.receive_within(&Budget::start(timeout)).await
    }

    async fn send_within(&mut self, payload: &[u8], budget: &Budget) -> Result<(), IpcError> {
        let prefix = encode_prefix(payload.len())?;
        budget.bound(self.stream.write_all(&prefix)).await?;
        budget.bound(self.stream.write_all(payload)).await?;
        budget.bound(self.stream.flush()).await?;
        Ok(())
    }

    async fn receive_within(&mut self, budget: &Budget) -> Result<&[u8], IpcError> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        read_exact_within(&mut self.stream, &mut prefix, budget).await?;
        let len = decode_prefix(prefix)?;

        if self.buffer.len() < len {
            self.buffer.reserve_exact(len - self.buffer.len());
            self.buffer.resize(len, 0);
        }

        read_exact_within(&mut self.stream, &mut self.buffer[..len], budget).await?;
        Ok(&self.buffer[..len])
    }
}
