// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffer management for the three record-pump buffers.
//!
//! Each buffer is a flat allocation with a fill cursor: bytes in
//! `[0, pos)` are filled, bytes in `[pos, capacity)` are spare. Buffers are
//! allocated lazily from a [`Pool`], grow geometrically up to a hard ceiling
//! and are returned to the pool whenever they drain completely. Buffers that
//! hold plaintext are wiped before they can reach pooled memory.

use crate::{
    engine::EngineError,
    error::{Error, Kind},
};
use core::fmt;
use std::sync::Arc;
use zeroize::Zeroize;

pub mod dest;
pub mod pool;
pub mod source;

pub use dest::Dest;
pub use pool::{Direct, Pool, Recycler};
pub use source::Source;

pub(crate) struct Buffer {
    data: Option<Vec<u8>>,
    pos: usize,
    initial: usize,
    ceiling: usize,
    plain: bool,
    pool: Arc<dyn Pool>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.pos)
            .field("capacity", &self.capacity())
            .field("ceiling", &self.ceiling)
            .field("plain", &self.plain)
            .finish()
    }
}

impl Buffer {
    pub(crate) fn new(initial: usize, ceiling: usize, plain: bool, pool: Arc<dyn Pool>) -> Self {
        debug_assert!(initial <= ceiling);
        Self {
            data: None,
            pos: 0,
            initial,
            ceiling,
            plain,
            pool,
        }
    }

    /// Allocates the buffer if it isn't currently backed by memory.
    pub(crate) fn prepare(&mut self) {
        if self.data.is_none() {
            self.data = Some(self.pool.take(self.initial));
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.pos
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    pub(crate) fn filled(&self) -> &[u8] {
        self.data.as_deref().map_or(&[], |data| &data[..self.pos])
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        let pos = self.pos;
        &mut self.data_mut()[pos..]
    }

    pub(crate) fn has_spare(&self) -> bool {
        self.capacity() > self.pos
    }

    /// Marks `n` spare bytes as filled.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.capacity());
        self.pos += n;
    }

    /// Drops `n` bytes from the front, compacting the remainder.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.pos);
        if n == 0 {
            return;
        }
        let pos = self.pos;
        self.data_mut().copy_within(n..pos, 0);
        self.pos -= n;
    }

    /// Grows geometrically toward the ceiling.
    ///
    /// Failing to grow means a record cannot fit even at the maximum record
    /// size; the engine and the peer disagree about framing, which is fatal.
    pub(crate) fn enlarge(&mut self) -> Result<(), Error> {
        self.prepare();
        let capacity = self.capacity();
        if capacity >= self.ceiling {
            return Err(Kind::Tls(EngineError::new(format!(
                "buffer already at maximum capacity ({} bytes)",
                self.ceiling
            )))
            .into());
        }
        self.reallocate((capacity * 2).min(self.ceiling));
        Ok(())
    }

    /// Grows to hold at least `n` bytes, silently capped at the ceiling.
    pub(crate) fn reserve_at_least(&mut self, n: usize) {
        self.prepare();
        let target = n.min(self.ceiling);
        if self.capacity() < target {
            self.reallocate(target);
        }
    }

    /// Wipes the spare region. Only meaningful for plain buffers, where the
    /// spare region can hold stale plaintext after a compaction.
    pub(crate) fn zero_remaining(&mut self) {
        if let Some(data) = self.data.as_mut() {
            let pos = self.pos;
            data[pos..].zeroize();
        }
    }

    /// Returns the buffer to its pool if it has fully drained.
    ///
    /// Returns `true` when the buffer no longer holds memory.
    pub(crate) fn release(&mut self) -> bool {
        if self.pos > 0 {
            return false;
        }
        if let Some(mut data) = self.data.take() {
            if self.plain {
                data.zeroize();
            }
            self.pool.give(data);
        }
        true
    }

    /// Drops the allocation unconditionally, discarding any contents.
    pub(crate) fn dispose(&mut self) {
        if let Some(mut data) = self.data.take() {
            if self.plain {
                data.zeroize();
            }
        }
        self.pos = 0;
    }

    fn reallocate(&mut self, new_capacity: usize) {
        let old = self.data.take().expect("buffer prepared before growth");
        let mut fresh = self.pool.take(new_capacity);
        fresh[..self.pos].copy_from_slice(&old[..self.pos]);
        let mut old = old;
        if self.plain {
            old.zeroize();
        }
        self.pool.give(old);
        self.data = Some(fresh);
    }

    fn data_mut(&mut self) -> &mut Vec<u8> {
        self.data.as_mut().expect("buffer prepared before access")
    }
}
