// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turns a pair of byte transports (one readable, one writable) into a single
//! encrypted byte channel by driving an external TLS engine.
//!
//! This crate does not implement any cryptography. It owns the record pump:
//! moving bytes between the transports, the engine's wrap/unwrap operations
//! and the caller, while handling handshakes, renegotiation, close_notify,
//! buffer growth and non-blocking backpressure.
//!
//! The transports are plain [`std::io::Read`] / [`std::io::Write`] values. In
//! non-blocking mode a transport that cannot make progress returns
//! [`std::io::ErrorKind::WouldBlock`], which surfaces from the channel as
//! [`error::Kind::ReadRequired`] or [`error::Kind::WriteRequired`]; the caller
//! retries the same operation once the transport is ready and the channel
//! resumes where it left off.

pub mod buffer;
pub mod channel;
pub mod engine;
pub mod error;
pub mod sync;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::{Builder, TlsChannel};
pub use engine::{Engine, EngineError, HandshakeStatus, Outcome, Status, Task};
pub use error::{Error, Kind};

/// Largest TLS record on the wire: 16 KiB of payload plus header, MAC and
/// padding overhead. No channel buffer ever grows beyond this.
pub const MAX_TLS_PACKET_SIZE: usize = 17 * 1024;

/// Starting capacity for all three channel buffers.
pub(crate) const INITIAL_BUFFER_SIZE: usize = 4096;
