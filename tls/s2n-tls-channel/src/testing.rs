// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Non-cryptographic test doubles for the channel.
//!
//! NOTE: this should only be used for testing.
//!
//! [`FramedEngine`] speaks a TLS-shaped record format (content-type byte,
//! big-endian `u16` length, payload) without encrypting anything, which
//! exercises every pump path deterministically: scripted handshakes,
//! under/overflow, delegated tasks, rehandshakes and close alerts.
//! [`duplex`] provides in-memory transport pairs in blocking and
//! non-blocking flavors.

use crate::{
    buffer::{Dest, Source},
    engine::{Engine, EngineError, HandshakeStatus, Outcome, Status, Task},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::Arc,
};

#[cfg(test)]
pub(crate) fn init_tracing() {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    // make sure this only gets initialized once
    TRACING.call_once(|| {
        let format = tracing_subscriber::fmt::format().compact();

        let env_filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(tracing::Level::DEBUG.into())
            .with_env_var("S2N_LOG")
            .from_env()
            .unwrap();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .event_format(format)
            .with_test_writer()
            .init();
    });
}

pub const HANDSHAKE: u8 = 0x16;
pub const APPLICATION_DATA: u8 = 0x17;
pub const ALERT: u8 = 0x15;
pub const HEADER_LEN: usize = 3;
/// Largest payload the engine packs into one record.
pub const MAX_FRAGMENT: usize = 16 * 1024;

/// Encodes one record.
pub fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.push(kind);
    record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    record.extend_from_slice(payload);
    record
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Wrap,
    Unwrap,
    Task,
}

#[derive(Clone, Copy, Debug)]
enum Role {
    Client,
    Server,
}

#[derive(Debug)]
struct State {
    script: VecDeque<Step>,
    negotiated: bool,
    inbound_closed: bool,
    outbound_closed: bool,
    close_sent: bool,
}

impl State {
    fn status(&self) -> HandshakeStatus {
        match self.script.front() {
            Some(Step::Wrap) => HandshakeStatus::NeedWrap,
            Some(Step::Unwrap) => HandshakeStatus::NeedUnwrap,
            Some(Step::Task) => HandshakeStatus::NeedTask,
            None => HandshakeStatus::NotHandshaking,
        }
    }

    /// Status to report from the operation that just popped a step.
    fn status_after_step(&mut self) -> HandshakeStatus {
        if self.script.is_empty() {
            self.negotiated = true;
            HandshakeStatus::Finished
        } else {
            self.status()
        }
    }
}

/// A record-framing, non-encrypting TLS engine double.
pub struct FramedEngine {
    state: Arc<Mutex<State>>,
    role: Role,
    with_task: bool,
    protocol: &'static str,
}

impl FramedEngine {
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    fn new(role: Role) -> Self {
        let engine = Self {
            state: Arc::new(Mutex::new(State {
                script: VecDeque::new(),
                negotiated: false,
                inbound_closed: false,
                outbound_closed: false,
                close_sent: false,
            })),
            role,
            with_task: false,
            protocol: "TLSv1.2",
        };
        engine.state.lock().script = engine.script();
        engine
    }

    /// Inserts a delegated task at the front of the handshake script.
    pub fn with_task(self) -> Self {
        let engine = Self {
            with_task: true,
            ..self
        };
        engine.state.lock().script = engine.script();
        engine
    }

    pub fn with_protocol(self, protocol: &'static str) -> Self {
        Self { protocol, ..self }
    }

    fn script(&self) -> VecDeque<Step> {
        let mut script: VecDeque<_> = match self.role {
            Role::Client => [Step::Wrap, Step::Unwrap].into(),
            Role::Server => [Step::Unwrap, Step::Wrap].into(),
        };
        if self.with_task {
            script.push_front(Step::Task);
        }
        script
    }
}

impl Engine for FramedEngine {
    fn begin_handshake(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.outbound_closed || state.inbound_closed {
            return Err(EngineError::new("handshake on a closed engine"));
        }
        if state.script.is_empty() {
            state.script = self.script();
        }
        Ok(())
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.state.lock().status()
    }

    fn wrap(&self, src: &mut Source<'_, '_>, dst: &mut [u8]) -> Result<Outcome, EngineError> {
        let mut state = self.state.lock();

        if state.outbound_closed {
            if !state.close_sent {
                if dst.len() < HEADER_LEN {
                    return Ok(Outcome {
                        status: Status::Overflow,
                        handshake: state.status(),
                        consumed: 0,
                        produced: 0,
                    });
                }
                dst[..HEADER_LEN].copy_from_slice(&frame(ALERT, &[]));
                state.close_sent = true;
                return Ok(Outcome {
                    status: Status::Closed,
                    handshake: state.status(),
                    consumed: 0,
                    produced: HEADER_LEN,
                });
            }
            return Ok(Outcome {
                status: Status::Closed,
                handshake: state.status(),
                consumed: 0,
                produced: 0,
            });
        }

        match state.script.front() {
            Some(Step::Wrap) => {
                let record = frame(HANDSHAKE, b"hs");
                if dst.len() < record.len() {
                    return Ok(Outcome {
                        status: Status::Overflow,
                        handshake: state.status(),
                        consumed: 0,
                        produced: 0,
                    });
                }
                dst[..record.len()].copy_from_slice(&record);
                state.script.pop_front();
                Ok(Outcome {
                    status: Status::Ok,
                    handshake: state.status_after_step(),
                    consumed: 0,
                    produced: record.len(),
                })
            }
            Some(step) => Err(EngineError::new(format!(
                "wrap while the engine needs {step:?}"
            ))),
            None => {
                if !src.has_remaining() {
                    return Ok(Outcome {
                        status: Status::Ok,
                        handshake: HandshakeStatus::NotHandshaking,
                        consumed: 0,
                        produced: 0,
                    });
                }
                let take = src.remaining().min(MAX_FRAGMENT);
                let needed = HEADER_LEN + take;
                if dst.len() < needed {
                    return Ok(Outcome {
                        status: Status::Overflow,
                        handshake: HandshakeStatus::NotHandshaking,
                        consumed: 0,
                        produced: 0,
                    });
                }
                dst[0] = APPLICATION_DATA;
                dst[1..HEADER_LEN].copy_from_slice(&(take as u16).to_be_bytes());
                let copied = src.copy_into(&mut dst[HEADER_LEN..needed]);
                debug_assert_eq!(copied, take);
                Ok(Outcome {
                    status: Status::Ok,
                    handshake: HandshakeStatus::NotHandshaking,
                    consumed: take,
                    produced: needed,
                })
            }
        }
    }

    fn unwrap(&self, src: &[u8], dst: &mut Dest<'_, '_>) -> Result<Outcome, EngineError> {
        let mut state = self.state.lock();

        if state.inbound_closed {
            return Ok(Outcome {
                status: Status::Closed,
                handshake: state.status(),
                consumed: 0,
                produced: 0,
            });
        }

        let underflow = |state: &State| Outcome {
            status: Status::Underflow,
            handshake: state.status(),
            consumed: 0,
            produced: 0,
        };
        if src.len() < HEADER_LEN {
            return Ok(underflow(&state));
        }
        let kind = src[0];
        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src.len() < HEADER_LEN + len {
            return Ok(underflow(&state));
        }
        let consumed = HEADER_LEN + len;

        match kind {
            ALERT => {
                state.inbound_closed = true;
                Ok(Outcome {
                    status: Status::Closed,
                    handshake: state.status(),
                    consumed,
                    produced: 0,
                })
            }
            HANDSHAKE => match state.script.front() {
                Some(Step::Unwrap) => {
                    state.script.pop_front();
                    Ok(Outcome {
                        status: Status::Ok,
                        handshake: state.status_after_step(),
                        consumed,
                        produced: 0,
                    })
                }
                None => {
                    // the peer started a rehandshake; respond in kind
                    state.script.push_back(Step::Wrap);
                    Ok(Outcome {
                        status: Status::Ok,
                        handshake: HandshakeStatus::NeedWrap,
                        consumed,
                        produced: 0,
                    })
                }
                Some(step) => Err(EngineError::new(format!(
                    "handshake record while the engine needs {step:?}"
                ))),
            },
            APPLICATION_DATA => {
                if !state.script.is_empty() {
                    return Err(EngineError::new("application record during the handshake"));
                }
                if dst.remaining() < len {
                    return Ok(Outcome {
                        status: Status::Overflow,
                        handshake: HandshakeStatus::NotHandshaking,
                        consumed: 0,
                        produced: 0,
                    });
                }
                dst.put_slice(&src[HEADER_LEN..consumed]);
                Ok(Outcome {
                    status: Status::Ok,
                    handshake: HandshakeStatus::NotHandshaking,
                    consumed,
                    produced: len,
                })
            }
            kind => Err(EngineError::new(format!("corrupt record type {kind:#04x}"))),
        }
    }

    fn delegated_task(&self) -> Option<Task> {
        let state = self.state.lock();
        if !matches!(state.script.front(), Some(Step::Task)) {
            return None;
        }
        drop(state);
        let state = self.state.clone();
        Some(Task::new(move || {
            let mut state = state.lock();
            if matches!(state.script.front(), Some(Step::Task)) {
                state.script.pop_front();
            }
        }))
    }

    fn close_outbound(&self) {
        self.state.lock().outbound_closed = true;
    }

    fn protocol(&self) -> Option<String> {
        self.state
            .lock()
            .negotiated
            .then(|| self.protocol.to_string())
    }
}

struct PipeState {
    queue: VecDeque<u8>,
    capacity: usize,
    eof: bool,
    blocking: bool,
}

type Shared = Arc<(Mutex<PipeState>, Condvar)>;

/// Read end of an in-memory unidirectional pipe.
pub struct PipeReader(Shared);

/// Write end of an in-memory unidirectional pipe. Dropping it signals EOF.
pub struct PipeWriter(Shared);

/// A unidirectional byte pipe with a bounded queue.
///
/// In non-blocking mode an empty read and a full write return
/// [`io::ErrorKind::WouldBlock`]; in blocking mode they park on a condvar.
pub fn pipe(capacity: usize, blocking: bool) -> (PipeReader, PipeWriter) {
    let shared: Shared = Arc::new((
        Mutex::new(PipeState {
            queue: VecDeque::new(),
            capacity,
            eof: false,
            blocking,
        }),
        Condvar::new(),
    ));
    (PipeReader(shared.clone()), PipeWriter(shared))
}

/// Two crossed pipes: the first endpoint writes what the second reads and
/// vice versa. Returns `((reader, writer), (reader, writer))`.
pub fn duplex(
    capacity: usize,
    blocking: bool,
) -> ((PipeReader, PipeWriter), (PipeReader, PipeWriter)) {
    let (read_a, write_b) = pipe(capacity, blocking);
    let (read_b, write_a) = pipe(capacity, blocking);
    ((read_a, write_a), (read_b, write_b))
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (lock, condvar) = &*self.0;
        let mut state = lock.lock();
        loop {
            if !state.queue.is_empty() {
                let n = buf.len().min(state.queue.len());
                for slot in buf[..n].iter_mut() {
                    *slot = state.queue.pop_front().expect("checked non-empty");
                }
                condvar.notify_all();
                return Ok(n);
            }
            if state.eof {
                return Ok(0);
            }
            if !state.blocking {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            condvar.wait(&mut state);
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (lock, condvar) = &*self.0;
        let mut state = lock.lock();
        loop {
            let space = state.capacity.saturating_sub(state.queue.len());
            if space > 0 {
                let n = buf.len().min(space);
                state.queue.extend(&buf[..n]);
                condvar.notify_all();
                return Ok(n);
            }
            if !state.blocking {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            condvar.wait(&mut state);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PipeWriter {
    /// Signals EOF to the read end without dropping the writer.
    pub fn close(&mut self) {
        let (lock, condvar) = &*self.0;
        lock.lock().eof = true;
        condvar.notify_all();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}
