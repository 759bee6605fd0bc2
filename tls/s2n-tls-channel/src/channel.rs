// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The record pump and its public facade.
//!
//! A channel owns three buffers and three critical sections:
//!
//! * `init` serializes handshake initialization and the session-init
//!   callback,
//! * `read` guards the readable transport, `in_encrypted` and `in_plain`,
//! * `write` guards the writable transport and `out_encrypted`.
//!
//! Lock acquisition always follows init → read → write. The handshake pump
//! needs both data locks; when it runs on behalf of a `read` that already
//! holds the read guard it borrows the held guard and acquires only the
//! write guard, so no lock is ever re-entered.
//!
//! Reads, writes and handshakes may be driven from different threads. A
//! non-blocking transport interrupts the pump with
//! [`Kind::ReadRequired`] / [`Kind::WriteRequired`]; all state is kept in
//! the session buffers, so retrying the same operation once the transport
//! is ready continues where the pump stopped.

use crate::{
    buffer::{Buffer, Dest, Direct, Pool, Source},
    engine::{Engine, EngineError, HandshakeStatus, Outcome, Status},
    error::{Error, Kind, PumpError},
    sync::{lock_api::RawMutex, DefaultRawMutex, Lock, SingleThreaded},
    INITIAL_BUFFER_SIZE, MAX_TLS_PACKET_SIZE,
};
use core::{
    fmt,
    marker::PhantomData,
    sync::atomic::{
        AtomicBool,
        Ordering::{Acquire, Release},
    },
};
use std::{
    io::{self, IoSlice, IoSliceMut, Read, Write},
    sync::Arc,
};

#[cfg(test)]
mod tests;

type SessionInit<E> =
    Box<dyn Fn(&E) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

struct Config<E> {
    explicit_handshake: bool,
    run_tasks: bool,
    wait_for_close_confirmation: bool,
    session_initializer: Option<SessionInit<E>>,
}

/// An encrypted byte channel over a readable/writable transport pair.
pub struct TlsChannel<E, R, W, L = DefaultRawMutex> {
    engine: E,
    config: Config<E>,
    init: Lock<L, ()>,
    read: Lock<L, ReadHalf<R>>,
    write: Lock<L, WriteHalf<W>>,
    negotiated: AtomicBool,
    handshaking: AtomicBool,
    invalid: AtomicBool,
    shutdown_sent: AtomicBool,
    shutdown_received: AtomicBool,
    closed: AtomicBool,
}

impl<E, R, W, L> fmt::Debug for TlsChannel<E, R, W, L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsChannel")
            .field("negotiated", &self.negotiated.load(Acquire))
            .field("handshaking", &self.handshaking.load(Acquire))
            .field("invalid", &self.invalid.load(Acquire))
            .field("shutdown_sent", &self.shutdown_sent.load(Acquire))
            .field("shutdown_received", &self.shutdown_received.load(Acquire))
            .field("closed", &self.closed.load(Acquire))
            .finish_non_exhaustive()
    }
}

struct ReadHalf<R> {
    transport: Option<R>,
    in_encrypted: Buffer,
    in_plain: Buffer,
}

struct WriteHalf<W> {
    transport: Option<W>,
    out_encrypted: Buffer,
    close_notify_wrapped: bool,
    close_notify_sent: bool,
}

/// Where unwrapped plaintext goes.
///
/// `Plain` re-resolves the live `in_plain` buffer at every engine call: the
/// buffer may be reallocated between iterations when a record does not fit.
enum Sink<'d, 'a, 'b> {
    Caller(&'d mut Dest<'a, 'b>),
    Plain,
}

#[derive(Clone, Copy, Debug)]
struct Unwrapped {
    produced: usize,
    status: HandshakeStatus,
    closed: bool,
}

impl<R: Read> ReadHalf<R> {
    /// One transport read into `in_encrypted`.
    fn read_transport(&mut self) -> Result<usize, PumpError> {
        let Self {
            transport,
            in_encrypted,
            ..
        } = self;
        let transport = transport.as_mut().ok_or(Kind::Closed)?;
        debug_assert!(in_encrypted.has_spare());
        loop {
            match transport.read(in_encrypted.spare_mut()) {
                Ok(0) => return Err(PumpError::Eof),
                Ok(n) => {
                    in_encrypted.advance(n);
                    return Ok(n);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Err(Kind::ReadRequired.into())
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(Kind::Io(error).into()),
            }
        }
    }

    /// Unwraps records out of `in_encrypted` until plaintext is produced,
    /// more encrypted bytes are needed, the peer closed, or the handshake
    /// status moved away from `original`.
    fn unwrap_loop<E: Engine>(
        &mut self,
        engine: &E,
        sink: &mut Sink<'_, '_, '_>,
        original: HandshakeStatus,
    ) -> Result<Unwrapped, PumpError> {
        let mut produced = 0;
        loop {
            let outcome = match sink {
                Sink::Caller(dest) => engine
                    .unwrap(self.in_encrypted.filled(), &mut **dest)
                    .map_err(Kind::Tls)?,
                Sink::Plain => {
                    self.in_plain.prepare();
                    let Self {
                        in_encrypted,
                        in_plain,
                        ..
                    } = self;
                    let outcome = {
                        let mut bufs = [IoSliceMut::new(in_plain.spare_mut())];
                        let mut dest = Dest::new(&mut bufs);
                        let outcome = engine
                            .unwrap(in_encrypted.filled(), &mut dest)
                            .map_err(Kind::Tls)?;
                        debug_assert_eq!(outcome.produced, dest.written());
                        outcome
                    };
                    in_plain.advance(outcome.produced);
                    outcome
                }
            };
            self.in_encrypted.consume(outcome.consumed);
            produced += outcome.produced;

            match outcome.status {
                Status::Closed => {
                    return Ok(Unwrapped {
                        produced,
                        status: outcome.handshake,
                        closed: true,
                    })
                }
                Status::Overflow => {
                    // The pending record's plaintext does not fit. Divert it
                    // into `in_plain`, growing as needed; leftover bytes are
                    // delivered by the next read.
                    self.in_plain.prepare();
                    if let Sink::Caller(dest) = sink {
                        let hint = (dest.remaining() * 2).min(MAX_TLS_PACKET_SIZE);
                        self.in_plain.reserve_at_least(hint);
                        *sink = Sink::Plain;
                    } else {
                        self.in_plain.enlarge()?;
                    }
                }
                Status::Ok | Status::Underflow => {
                    if outcome.status == Status::Underflow
                        || produced > 0
                        || outcome.handshake != original
                    {
                        return Ok(Unwrapped {
                            produced,
                            status: outcome.handshake,
                            closed: false,
                        });
                    }
                    // consumed a record without visible progress; keep going
                }
            }
        }
    }

    /// Alternates transport reads and unwraps until one of the unwrap-loop
    /// exit conditions holds.
    fn read_and_unwrap<E: Engine>(
        &mut self,
        engine: &E,
        sink: &mut Sink<'_, '_, '_>,
    ) -> Result<Unwrapped, PumpError> {
        let original = engine.handshake_status();
        self.in_encrypted.prepare();
        let result = self.read_and_unwrap_pump(engine, sink, original);
        self.in_encrypted.release();
        result
    }

    fn read_and_unwrap_pump<E: Engine>(
        &mut self,
        engine: &E,
        sink: &mut Sink<'_, '_, '_>,
        original: HandshakeStatus,
    ) -> Result<Unwrapped, PumpError> {
        loop {
            let unwrapped = self.unwrap_loop(engine, sink, original)?;
            if unwrapped.produced > 0 || unwrapped.closed || unwrapped.status != original {
                return Ok(unwrapped);
            }
            // need more encrypted bytes
            if !self.in_encrypted.has_spare() {
                self.in_encrypted.enlarge()?;
            } else {
                self.read_transport()?;
            }
        }
    }

    /// Moves pending decrypted bytes into the caller's buffers.
    fn transfer_pending(&mut self, dest: &mut Dest<'_, '_>) -> usize {
        let n = dest.remaining().min(self.in_plain.len());
        dest.put_slice(&self.in_plain.filled()[..n]);
        self.in_plain.consume(n);
        if !self.in_plain.release() {
            self.in_plain.zero_remaining();
        }
        n
    }
}

impl<W: Write> WriteHalf<W> {
    /// Writes all of `out_encrypted` to the transport.
    fn flush_transport(&mut self) -> Result<(), PumpError> {
        let Self {
            transport,
            out_encrypted,
            ..
        } = self;
        let transport = transport.as_mut().ok_or(Kind::Closed)?;
        while !out_encrypted.is_empty() {
            match transport.write(out_encrypted.filled()) {
                Ok(0) => return Err(Kind::WriteRequired.into()),
                Ok(n) => out_encrypted.consume(n),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Err(Kind::WriteRequired.into())
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(Kind::Io(error).into()),
            }
        }
        Ok(())
    }

    /// Wraps one record into `out_encrypted`, growing it on overflow.
    fn wrap_loop<E: Engine>(
        &mut self,
        engine: &E,
        src: &mut Source<'_, '_>,
    ) -> Result<Outcome, PumpError> {
        self.out_encrypted.prepare();
        loop {
            let outcome = engine
                .wrap(src, self.out_encrypted.spare_mut())
                .map_err(Kind::Tls)?;
            self.out_encrypted.advance(outcome.produced);
            match outcome.status {
                Status::Ok | Status::Closed => return Ok(outcome),
                Status::Overflow => {
                    debug_assert_eq!(outcome.consumed, 0);
                    self.out_encrypted.enlarge()?;
                }
                Status::Underflow => {
                    return Err(Kind::Tls(EngineError::new(
                        "engine reported underflow during wrap",
                    ))
                    .into())
                }
            }
        }
    }

    /// Alternates flushes and wraps until the source is drained.
    ///
    /// Consumed bytes whose records are still buffered in `out_encrypted`
    /// count as written: the next call (even with an empty source) flushes
    /// them first. `WriteRequired` only surfaces when nothing was consumed.
    fn wrap_and_write<E: Engine>(
        &mut self,
        engine: &E,
        src: &mut Source<'_, '_>,
    ) -> Result<usize, PumpError> {
        self.out_encrypted.prepare();
        let mut consumed = 0;
        let result = loop {
            match self.flush_transport() {
                Ok(()) => {}
                Err(PumpError::Error(error))
                    if consumed > 0 && matches!(error.kind(), Kind::WriteRequired) =>
                {
                    break Ok(consumed);
                }
                Err(error) => break Err(error),
            }
            if !src.has_remaining() {
                break Ok(consumed);
            }
            match self.wrap_loop(engine, src) {
                Ok(outcome) => {
                    consumed += outcome.consumed;
                    if outcome.status == Status::Closed && src.has_remaining() {
                        // the engine refuses further plaintext
                        break Err(Kind::Closed.into());
                    }
                }
                Err(error) => break Err(error),
            }
        };
        self.out_encrypted.release();
        result
    }
}

impl<E, R, W> TlsChannel<E, R, W>
where
    E: Engine,
    R: Read,
    W: Write,
{
    pub fn builder(engine: E, reader: R, writer: W) -> Builder<E, R, W> {
        Builder::new(engine, reader, writer)
    }
}

impl<E, R, W, L> TlsChannel<E, R, W, L>
where
    E: Engine,
    R: Read,
    W: Write,
    L: RawMutex,
{
    // --- public surface ---

    /// Reads decrypted bytes into `buf`. Returns `Ok(0)` on a clean
    /// end-of-stream (close_notify or transport EOF).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut bufs = [IoSliceMut::new(buf)];
        self.read_vectored(&mut bufs)
    }

    /// Scatter variant of [`read`](Self::read).
    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize, Error> {
        let mut dest = Dest::new(bufs);
        if !dest.has_remaining() {
            return Ok(0);
        }
        if !self.config.explicit_handshake {
            self.handshake()?;
        }
        let mut read = self.read.lock();
        match self.read_locked(&mut read, &mut dest) {
            Ok(n) => Ok(n),
            Err(PumpError::Eof) => Ok(0),
            Err(PumpError::Error(error)) => Err(error),
        }
    }

    /// Encrypts and writes bytes from `buf`, returning how many were
    /// accepted. Accepted bytes may still sit in the outbound buffer when
    /// the transport backpressures; any call (including a zero-length
    /// write) flushes them before doing anything else.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let bufs = [IoSlice::new(buf)];
        self.write_vectored(&bufs)
    }

    /// Gather variant of [`write`](Self::write).
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize, Error> {
        let mut src = Source::new(bufs);
        if !self.config.explicit_handshake {
            self.handshake()?;
        }
        let mut write = self.write.lock();
        match self.write_locked(&mut write, &mut src) {
            Ok(n) => Ok(n),
            Err(PumpError::Eof) => Err(Kind::Closed.err()),
            Err(PumpError::Error(error)) => Err(error),
        }
    }

    /// Completes the initial handshake if it hasn't completed yet.
    pub fn handshake(&self) -> Result<(), Error> {
        self.do_handshake(false)
    }

    /// Forces a new handshake over the established session.
    ///
    /// TLS 1.3 removed renegotiation, so this refuses on any protocol that
    /// orders at or above `"TLSv1.3"`. The comparison is lexicographic on
    /// the protocol name, which holds for every `"TLSv1*"` name in use.
    pub fn renegotiate(&self) -> Result<(), Error> {
        if let Some(protocol) = self.engine.protocol() {
            if protocol.as_str() >= "TLSv1.3" {
                return Err(Kind::Tls(EngineError::new(
                    "renegotiation not supported in TLS 1.3 or newer",
                ))
                .err());
            }
        }
        self.do_handshake(true)
    }

    /// Drives the close_notify exchange.
    ///
    /// The first successful call sends our close_notify and returns whether
    /// the peer's has already arrived; a subsequent call waits for it.
    /// Returns `true` once both directions are shut down.
    pub fn shutdown(&self) -> Result<bool, Error> {
        let mut read = self.read.lock();
        let mut write = self.write.lock();
        match self.shutdown_locked(&mut read, &mut write) {
            Ok(done) => Ok(done),
            Err(PumpError::Eof) => Err(Kind::Closed.err()),
            Err(PumpError::Error(error)) => Err(error),
        }
    }

    /// Closes the channel: a best-effort TLS shutdown, then the transports
    /// and buffers are released. Never fails; shutdown errors are logged
    /// and discarded.
    pub fn close(&self) {
        self.try_shutdown();
        self.closed.store(true, Release);
        let mut read = self.read.lock();
        let mut write = self.write.lock();
        read.transport = None;
        write.transport = None;
        Self::free_buffers(&mut read, &mut write);
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Acquire)
    }

    /// Whether our close_notify has been handed to the engine.
    pub fn shutdown_sent(&self) -> bool {
        self.shutdown_sent.load(Acquire)
    }

    /// Whether the peer's close_notify has been received.
    pub fn shutdown_received(&self) -> bool {
        self.shutdown_received.load(Acquire)
    }

    /// Whether the handshake pump is currently running.
    pub fn is_handshaking(&self) -> bool {
        self.handshaking.load(Acquire)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn run_tasks(&self) -> bool {
        self.config.run_tasks
    }

    pub fn wait_for_close_confirmation(&self) -> bool {
        self.config.wait_for_close_confirmation
    }

    /// Exclusive access to the underlying transports.
    pub fn transports_mut(&mut self) -> (Option<&mut R>, Option<&mut W>) {
        (
            self.read.get_mut().transport.as_mut(),
            self.write.get_mut().transport.as_mut(),
        )
    }

    // --- handshake driver ---

    fn do_handshake(&self, force: bool) -> Result<(), Error> {
        self.ensure_active()?;
        if !force && self.negotiated.load(Acquire) {
            return Ok(());
        }
        let _init = self.init.lock();
        self.ensure_active()?;
        if !force && self.negotiated.load(Acquire) {
            return Ok(());
        }

        {
            let mut read = self.read.lock();
            let mut write = self.write.lock();
            let result = self.do_work(&mut read, &mut write, &mut Sink::Plain, force);
            match result {
                Ok(_) => {}
                Err(PumpError::Eof) => return Err(Kind::Closed.err()),
                Err(PumpError::Error(error)) => return Err(error),
            }
        }

        // Still under the init lock; the callback must not re-enter the
        // channel. Negotiation is recorded only if the callback succeeds.
        if let Some(callback) = &self.config.session_initializer {
            callback(&self.engine).map_err(|error| Kind::InitCallback(error).err())?;
        }
        self.negotiated.store(true, Release);
        Ok(())
    }

    /// The handshake pump. The caller holds both data guards.
    fn do_work(
        &self,
        read: &mut ReadHalf<R>,
        write: &mut WriteHalf<W>,
        sink: &mut Sink<'_, '_, '_>,
        force: bool,
    ) -> Result<usize, PumpError> {
        if force || !self.negotiated.load(Acquire) {
            self.seal(self.engine.begin_handshake().map_err(|e| Kind::Tls(e).err()))?;
        }
        debug_assert!(read.in_plain.is_empty());
        write.out_encrypted.prepare();
        // Flush whatever a previously interrupted step left behind.
        self.seal(write.flush_transport())?;
        self.handshaking.store(true, Release);
        tracing::debug!(force, "driving handshake");
        loop {
            if let Some(produced) = self.handshake_step(read, write, sink)? {
                self.handshaking.store(false, Release);
                return Ok(produced);
            }
        }
    }

    /// One handshake pump step. `Some(n)` means the handshake is over and
    /// `n` plaintext bytes were delivered to the sink along the way.
    fn handshake_step(
        &self,
        read: &mut ReadHalf<R>,
        write: &mut WriteHalf<W>,
        sink: &mut Sink<'_, '_, '_>,
    ) -> Result<Option<usize>, PumpError> {
        match self.engine.handshake_status() {
            HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => Ok(Some(0)),
            HandshakeStatus::NeedWrap => {
                debug_assert!(write.out_encrypted.is_empty());
                let mut dummy = Source::empty();
                self.seal(write.wrap_loop(&self.engine, &mut dummy))?;
                self.seal(write.flush_transport())?;
                Ok(None)
            }
            HandshakeStatus::NeedUnwrap => {
                let unwrapped = self.read_and_unwrap(read, sink)?;
                if unwrapped.closed {
                    return Err(Kind::Closed.into());
                }
                if self.engine.handshake_status() == HandshakeStatus::NeedUnwrap
                    && unwrapped.produced > 0
                {
                    // Plaintext arrived interleaved with handshake records;
                    // surface it so the read in progress can deliver it.
                    return Ok(Some(unwrapped.produced));
                }
                Ok(None)
            }
            HandshakeStatus::NeedTask => {
                self.handle_task()?;
                Ok(None)
            }
        }
    }

    fn handle_task(&self) -> Result<(), PumpError> {
        if self.config.run_tasks {
            while let Some(task) = self.engine.delegated_task() {
                task.run();
            }
            Ok(())
        } else if let Some(task) = self.engine.delegated_task() {
            tracing::trace!("surfacing delegated task to the caller");
            Err(Kind::TaskRequired(task).into())
        } else {
            Ok(())
        }
    }

    // --- data paths ---

    fn read_locked(
        &self,
        read: &mut ReadHalf<R>,
        dest: &mut Dest<'_, '_>,
    ) -> Result<usize, PumpError> {
        self.ensure_active()?;
        let mut status = self.engine.handshake_status();
        if status.is_active() && self.config.explicit_handshake && !self.negotiated.load(Acquire) {
            return Err(Kind::HandshakeRequired.into());
        }
        let mut bytes_to_return = read.in_plain.len();
        loop {
            if bytes_to_return > 0 {
                return Ok(if read.in_plain.is_empty() {
                    // everything went straight into the caller's buffers
                    bytes_to_return
                } else {
                    read.transfer_pending(dest)
                });
            }
            if self.shutdown_received.load(Acquire) {
                return Err(PumpError::Eof);
            }
            match status {
                HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedWrap => {
                    bytes_to_return = self.drive_handshake_in_read(read, dest)?;
                    status = HandshakeStatus::NotHandshaking;
                }
                HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => {
                    let mut sink = Sink::Caller(&mut *dest);
                    let unwrapped = self.read_and_unwrap(read, &mut sink)?;
                    if unwrapped.closed {
                        return Err(PumpError::Eof);
                    }
                    bytes_to_return = unwrapped.produced;
                    status = unwrapped.status;
                }
                HandshakeStatus::NeedTask => {
                    self.handle_task()?;
                    status = self.engine.handshake_status();
                }
            }
        }
    }

    /// A renegotiation (or handshake continuation) discovered while holding
    /// the read guard: borrow it as the held-locks token and take only the
    /// missing write guard, preserving the global lock order.
    fn drive_handshake_in_read(
        &self,
        read: &mut ReadHalf<R>,
        dest: &mut Dest<'_, '_>,
    ) -> Result<usize, PumpError> {
        let mut write = self.write.lock();
        let mut sink = Sink::Caller(&mut *dest);
        self.do_work(read, &mut write, &mut sink, false)
    }

    fn write_locked(
        &self,
        write: &mut WriteHalf<W>,
        src: &mut Source<'_, '_>,
    ) -> Result<usize, PumpError> {
        self.ensure_active()?;
        if self.engine.handshake_status().is_active()
            && self.config.explicit_handshake
            && !self.negotiated.load(Acquire)
        {
            return Err(Kind::HandshakeRequired.into());
        }
        self.seal(write.wrap_and_write(&self.engine, src))
    }

    fn read_and_unwrap(
        &self,
        read: &mut ReadHalf<R>,
        sink: &mut Sink<'_, '_, '_>,
    ) -> Result<Unwrapped, PumpError> {
        let unwrapped = self.seal(read.read_and_unwrap(&self.engine, sink))?;
        if unwrapped.closed {
            self.shutdown_received.store(true, Release);
        }
        Ok(unwrapped)
    }

    // --- shutdown ---

    fn shutdown_locked(
        &self,
        read: &mut ReadHalf<R>,
        write: &mut WriteHalf<W>,
    ) -> Result<bool, PumpError> {
        if self.invalid.load(Acquire) || self.closed.load(Acquire) {
            return Err(Kind::Closed.into());
        }

        if !write.close_notify_sent {
            // The send phase concludes exactly once; a call retried after a
            // WriteRequired interruption resumes here and still reports
            // instead of waiting for the peer.
            self.shutdown_sent.store(true, Release);
            write.out_encrypted.prepare();
            self.seal(write.flush_transport())?;
            if !write.close_notify_wrapped {
                self.engine.close_outbound();
                let mut dummy = Source::empty();
                self.seal(write.wrap_loop(&self.engine, &mut dummy))?;
                write.close_notify_wrapped = true;
            }
            self.seal(write.flush_transport())?;
            write.close_notify_sent = true;
            let received = self.shutdown_received.load(Acquire);
            if received {
                Self::free_buffers(read, write);
            }
            return Ok(received);
        }

        while !self.shutdown_received.load(Acquire) {
            // drain (and discard into `in_plain`) until the peer's alert
            self.read_and_unwrap(read, &mut Sink::Plain)?;
        }
        Self::free_buffers(read, write);
        Ok(true)
    }

    fn try_shutdown(&self) {
        let Some(mut read) = self.read.try_lock() else {
            return;
        };
        let Some(mut write) = self.write.try_lock() else {
            return;
        };
        if self.invalid.load(Acquire) || self.closed.load(Acquire) {
            return;
        }
        let mut result = self.shutdown_locked(&mut read, &mut write);
        if matches!(result, Ok(false)) && self.config.wait_for_close_confirmation {
            result = self.shutdown_locked(&mut read, &mut write);
        }
        if let Err(error) = result {
            let error = match error {
                PumpError::Eof => Kind::Closed.err(),
                PumpError::Error(error) => error,
            };
            tracing::debug!("error during TLS shutdown on close, continuing: {error}");
        }
    }

    // --- shared plumbing ---

    fn ensure_active(&self) -> Result<(), Error> {
        if self.invalid.load(Acquire)
            || self.shutdown_sent.load(Acquire)
            || self.closed.load(Acquire)
        {
            return Err(Kind::Closed.err());
        }
        Ok(())
    }

    /// Fatal engine and transport failures latch the session invalid;
    /// everything afterwards fails with [`Kind::Closed`].
    fn seal<T, F: Into<PumpError>>(&self, result: Result<T, F>) -> Result<T, PumpError> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                let error = error.into();
                if let PumpError::Error(error) = &error {
                    if matches!(error.kind(), Kind::Tls(_) | Kind::Io(_)) {
                        self.invalid.store(true, Release);
                    }
                }
                Err(error)
            }
        }
    }

    fn free_buffers(read: &mut ReadHalf<R>, write: &mut WriteHalf<W>) {
        read.in_encrypted.dispose();
        read.in_plain.dispose();
        write.out_encrypted.dispose();
    }
}

impl<E, R, W, L> io::Read for TlsChannel<E, R, W, L>
where
    E: Engine,
    R: Read,
    W: Write,
    L: RawMutex,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TlsChannel::read(self, buf).map_err(Into::into)
    }
}

impl<E, R, W, L> io::Write for TlsChannel<E, R, W, L>
where
    E: Engine,
    R: Read,
    W: Write,
    L: RawMutex,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TlsChannel::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        // a zero-length write drains wrapped-but-unflushed records
        TlsChannel::write(self, &[]).map(|_| ()).map_err(Into::into)
    }
}

impl<E, R, W, L> io::Read for &TlsChannel<E, R, W, L>
where
    E: Engine,
    R: Read,
    W: Write,
    L: RawMutex,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TlsChannel::read(*self, buf).map_err(Into::into)
    }
}

impl<E, R, W, L> io::Write for &TlsChannel<E, R, W, L>
where
    E: Engine,
    R: Read,
    W: Write,
    L: RawMutex,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TlsChannel::write(*self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        TlsChannel::write(*self, &[]).map(|_| ()).map_err(Into::into)
    }
}

/// Configures and assembles a [`TlsChannel`].
pub struct Builder<E, R, W, L = DefaultRawMutex> {
    engine: E,
    reader: R,
    writer: W,
    explicit_handshake: bool,
    run_tasks: bool,
    wait_for_close_confirmation: bool,
    session_initializer: Option<SessionInit<E>>,
    plain_pool: Arc<dyn Pool>,
    encrypted_pool: Arc<dyn Pool>,
    lock: PhantomData<L>,
}

impl<E, R, W> Builder<E, R, W> {
    fn new(engine: E, reader: R, writer: W) -> Self {
        Self {
            engine,
            reader,
            writer,
            explicit_handshake: false,
            run_tasks: true,
            wait_for_close_confirmation: false,
            session_initializer: None,
            plain_pool: Arc::new(Direct),
            encrypted_pool: Arc::new(Direct),
            lock: PhantomData,
        }
    }
}

impl<E, R, W, L> Builder<E, R, W, L> {
    /// When set, `read` and `write` fail with
    /// [`Kind::HandshakeRequired`] until [`TlsChannel::handshake`] has been
    /// called; otherwise they drive the handshake themselves.
    pub fn with_explicit_handshake(mut self, explicit: bool) -> Self {
        self.explicit_handshake = explicit;
        self
    }

    /// When unset, delegated engine tasks surface as
    /// [`Kind::TaskRequired`] instead of running inline.
    pub fn with_run_tasks(mut self, run_tasks: bool) -> Self {
        self.run_tasks = run_tasks;
        self
    }

    /// When set, [`TlsChannel::close`] also waits for the peer's
    /// close_notify after sending ours.
    pub fn with_wait_for_close_confirmation(mut self, wait: bool) -> Self {
        self.wait_for_close_confirmation = wait;
        self
    }

    /// Invoked once the handshake completes, before any read or write can
    /// observe the session. Runs inside the init critical section and must
    /// not re-enter the channel.
    pub fn with_session_initializer(
        mut self,
        callback: impl Fn(&E) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.session_initializer = Some(Box::new(callback));
        self
    }

    /// Pool backing the decrypted-plaintext buffer.
    pub fn with_plain_pool(mut self, pool: Arc<dyn Pool>) -> Self {
        self.plain_pool = pool;
        self
    }

    /// Pool backing the two ciphertext buffers.
    pub fn with_encrypted_pool(mut self, pool: Arc<dyn Pool>) -> Self {
        self.encrypted_pool = pool;
        self
    }

    /// Replaces the locks with no-op stand-ins; the channel becomes `!Sync`.
    pub fn single_threaded(self) -> Builder<E, R, W, SingleThreaded> {
        Builder {
            engine: self.engine,
            reader: self.reader,
            writer: self.writer,
            explicit_handshake: self.explicit_handshake,
            run_tasks: self.run_tasks,
            wait_for_close_confirmation: self.wait_for_close_confirmation,
            session_initializer: self.session_initializer,
            plain_pool: self.plain_pool,
            encrypted_pool: self.encrypted_pool,
            lock: PhantomData,
        }
    }
}

impl<E, R, W, L> Builder<E, R, W, L>
where
    E: Engine,
    R: Read,
    W: Write,
    L: RawMutex,
{
    pub fn build(self) -> TlsChannel<E, R, W, L> {
        TlsChannel {
            engine: self.engine,
            config: Config {
                explicit_handshake: self.explicit_handshake,
                run_tasks: self.run_tasks,
                wait_for_close_confirmation: self.wait_for_close_confirmation,
                session_initializer: self.session_initializer,
            },
            init: Lock::new(()),
            read: Lock::new(ReadHalf {
                transport: Some(self.reader),
                in_encrypted: Buffer::new(
                    INITIAL_BUFFER_SIZE,
                    MAX_TLS_PACKET_SIZE,
                    false,
                    self.encrypted_pool.clone(),
                ),
                in_plain: Buffer::new(
                    INITIAL_BUFFER_SIZE,
                    MAX_TLS_PACKET_SIZE,
                    true,
                    self.plain_pool,
                ),
            }),
            write: Lock::new(WriteHalf {
                transport: Some(self.writer),
                out_encrypted: Buffer::new(
                    INITIAL_BUFFER_SIZE,
                    MAX_TLS_PACKET_SIZE,
                    false,
                    self.encrypted_pool,
                ),
                close_notify_wrapped: false,
                close_notify_sent: false,
            }),
            negotiated: AtomicBool::new(false),
            handshaking: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            shutdown_sent: AtomicBool::new(false),
            shutdown_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}
