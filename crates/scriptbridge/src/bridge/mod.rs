//! IPC bridge between the host and the peer interpreter.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (Command, Response, ControlSignal) and escaping
//! - **codec**: Line framing codec for AsyncRead/AsyncWrite
//! - **transport**: Process spawning, stdio pipes, exit detection

pub mod codec;
pub mod protocol;
pub mod transport;
