//! Managed KaTeX worker process and its framed IPC channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   Unix socket / TCP loopback   ┌─────────────────────┐
//! │  RenderGateway  │  ◄──────────────────────────►  │  katex-server.js    │
//! │ (WorkerHandle)  │   i32 LE length + JSON body    │      (node)         │
//! └─────────────────┘                                └─────────────────────┘
//! ```
//!
//! - `transport` - picks the socket kind and address, wraps the connected stream
//! - `supervisor` - spawns the worker, waits for readiness, tears it down
//! - `framing` - length-prefixed request/response exchange under a deadline

pub mod framing;
pub mod supervisor;
pub mod transport;

pub use framing::{write_frame, FramedChannel, MAX_FRAME_SIZE};
pub use supervisor::{WorkerCommand, WorkerHandle, WorkerSupervisor, STOP_GRACE_PERIOD};
pub use transport::{choose_transport, Transport, TransportAddress, TransportKind};
