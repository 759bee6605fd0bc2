// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::engine::{EngineError, Task};
use core::{fmt, panic::Location};
use std::io;

pub struct Error {
    kind: Kind,
    location: &'static Location<'static>,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("crate", &"s2n-tls-channel")
            .field("file", &self.file())
            .field("line", &self.location.line())
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self { kind, location } = self;
        let file = self.file();
        let line = location.line();
        write!(f, "[s2n-tls-channel::{file}:{line}]: {kind}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

impl Error {
    #[track_caller]
    #[inline]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            location: Location::caller(),
        }
    }

    #[inline]
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    #[inline]
    pub fn into_kind(self) -> Kind {
        self.kind
    }

    /// Whether the operation can be retried once the condition named by the
    /// kind (transport readiness, a task run, a completed handshake) has
    /// been supplied. Non-retryable errors leave the session invalid.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            Kind::ReadRequired
                | Kind::WriteRequired
                | Kind::TaskRequired(_)
                | Kind::HandshakeRequired
        )
    }

    #[inline]
    fn file(&self) -> &'static str {
        self.location
            .file()
            .trim_start_matches(concat!(env!("CARGO_MANIFEST_DIR"), "/src/"))
    }
}

impl From<Kind> for Error {
    #[track_caller]
    #[inline]
    fn from(kind: Kind) -> Self {
        Self::new(kind)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Kind {
    #[error("the transport must become readable before the operation can make progress")]
    ReadRequired,
    #[error("the transport must become writable before the operation can make progress")]
    WriteRequired,
    #[error("a delegated engine task must run before the operation can make progress")]
    TaskRequired(Task),
    #[error("the handshake has not been completed")]
    HandshakeRequired,
    #[error("the channel is closed")]
    Closed,
    #[error("TLS protocol failure: {0}")]
    Tls(#[source] EngineError),
    #[error("the session initialization callback failed: {0}")]
    InitCallback(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("transport failure: {0}")]
    Io(#[source] io::Error),
}

impl Kind {
    #[inline]
    #[track_caller]
    pub(crate) fn err(self) -> Error {
        Error::new(self)
    }

    #[inline]
    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Kind::ReadRequired | Kind::WriteRequired => io::ErrorKind::WouldBlock,
            // both block on a caller-supplied condition, same as readiness
            Kind::TaskRequired(_) | Kind::HandshakeRequired => io::ErrorKind::WouldBlock,
            Kind::Closed => io::ErrorKind::NotConnected,
            Kind::Tls(_) => io::ErrorKind::InvalidData,
            Kind::InitCallback(_) => io::ErrorKind::Other,
            Kind::Io(error) => error.kind(),
        }
    }
}

impl From<Error> for io::Error {
    #[inline]
    fn from(error: Error) -> Self {
        Self::new(error.kind.io_kind(), error)
    }
}

/// Pump-internal control flow: a transport EOF is not an error by itself,
/// it becomes `Ok(0)` from a read or `Kind::Closed` from a handshake or
/// shutdown, depending on the phase that saw it.
#[derive(Debug)]
pub(crate) enum PumpError {
    Eof,
    Error(Error),
}

impl From<Error> for PumpError {
    #[inline]
    fn from(error: Error) -> Self {
        Self::Error(error)
    }
}

impl From<Kind> for PumpError {
    #[track_caller]
    #[inline]
    fn from(kind: Kind) -> Self {
        Self::Error(Error::new(kind))
    }
}
