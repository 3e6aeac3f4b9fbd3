//! Control-plane bridge between the supervisor and a manager.
//!
//! # Architecture
//!
//! - **protocol**: Envelope and payload types (RESTART_CLIENT, GUILD_CREATE, READY_CLIENT, ...)
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
