// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contract between the channel and the TLS state machine driving it.
//!
//! The engine owns all cryptographic and protocol state; the channel only
//! moves bytes. Engines are shared between the channel's read and write
//! critical sections, so `wrap` and `unwrap` may be called concurrently from
//! two threads and implementations synchronize internally (typically a mutex
//! around the underlying connection).

use crate::buffer::{Dest, Source};
use core::fmt;

/// What the engine needs next in order to make handshake progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine has handshake records to emit; drive `wrap`.
    NeedWrap,
    /// The engine needs records from the peer; drive `unwrap`.
    NeedUnwrap,
    /// A delegated task must run before the engine can continue.
    NeedTask,
    /// The handshake completed with the operation that reported this.
    Finished,
    /// No handshake is in progress.
    NotHandshaking,
}

impl HandshakeStatus {
    /// Whether the record pump has handshake work to do.
    pub fn is_active(self) -> bool {
        matches!(self, Self::NeedWrap | Self::NeedUnwrap | Self::NeedTask)
    }
}

/// Result category of a single wrap or unwrap call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The operation consumed and/or produced bytes normally.
    Ok,
    /// The close_notify alert has been sent (wrap) or received (unwrap).
    Closed,
    /// The destination cannot hold the pending record; nothing was consumed.
    Overflow,
    /// The source does not yet hold a complete record; nothing was consumed.
    Underflow,
}

/// Byte accounting for a single wrap or unwrap call.
#[derive(Clone, Copy, Debug)]
pub struct Outcome {
    pub status: Status,
    pub handshake: HandshakeStatus,
    /// Bytes taken from the source side.
    pub consumed: usize,
    /// Bytes delivered to the destination side.
    pub produced: usize,
}

/// A deferred engine computation (certificate validation, key derivation).
///
/// Tasks escape to the caller inside [`crate::Kind::TaskRequired`] when the
/// channel is configured not to run them inline. Run it, then retry the
/// interrupted operation.
pub struct Task(Box<dyn FnOnce() + Send + Sync>);

impl Task {
    pub fn new(task: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Box::new(task))
    }

    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// A failure reported by the engine itself.
///
/// Any engine error is fatal for the session: the channel marks itself
/// invalid before propagating it.
#[derive(Debug)]
pub struct EngineError(Box<dyn std::error::Error + Send + Sync>);

impl EngineError {
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// The TLS state machine the channel pumps records through.
pub trait Engine: Send + Sync {
    /// Starts (or restarts, for renegotiation) the handshake.
    ///
    /// Must be idempotent while a handshake is already in flight: the
    /// channel re-enters after non-blocking interruptions.
    fn begin_handshake(&self) -> Result<(), EngineError>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// Encrypts plaintext from `src` into the record bytes of `dst`.
    ///
    /// Emits at most one record per call. Reports `Overflow` without
    /// consuming anything when `dst` cannot hold the record. During a
    /// handshake `src` is typically empty and the record carries only
    /// handshake content.
    fn wrap(&self, src: &mut Source<'_, '_>, dst: &mut [u8]) -> Result<Outcome, EngineError>;

    /// Decrypts one record from the front of `src` into `dst`.
    ///
    /// Reports `Underflow` without consuming anything when `src` does not
    /// hold a complete record, and `Overflow` without consuming anything
    /// when the record's plaintext exceeds `dst.remaining()`.
    fn unwrap(&self, src: &[u8], dst: &mut Dest<'_, '_>) -> Result<Outcome, EngineError>;

    /// Takes the next pending delegated task, if any.
    fn delegated_task(&self) -> Option<Task>;

    /// Queues the close_notify alert; the channel wraps and flushes it.
    fn close_outbound(&self);

    /// The negotiated protocol version name (e.g. `"TLSv1.2"`), once known.
    fn protocol(&self) -> Option<String>;
}
