// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use crossbeam_queue::ArrayQueue;

/// Supplies and recycles the raw allocations behind channel buffers.
///
/// A channel takes two pools: one for buffers that only ever hold ciphertext
/// and one for buffers that hold plaintext. The channel wipes plaintext
/// buffers before handing them back, so pools never observe decrypted bytes.
pub trait Pool: Send + Sync {
    /// Supplies a zero-filled buffer with `len() == capacity`.
    fn take(&self, capacity: usize) -> Vec<u8>;

    /// Recycles a buffer previously supplied by `take`.
    fn give(&self, buffer: Vec<u8>);
}

/// Allocates fresh on every `take` and frees on every `give`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Direct;

impl Pool for Direct {
    #[inline]
    fn take(&self, capacity: usize) -> Vec<u8> {
        vec![0; capacity]
    }

    #[inline]
    fn give(&self, _buffer: Vec<u8>) {}
}

/// Keeps a bounded free list of returned buffers.
pub struct Recycler {
    free: ArrayQueue<Vec<u8>>,
}

impl Recycler {
    pub fn new(slots: usize) -> Self {
        Self {
            free: ArrayQueue::new(slots),
        }
    }
}

impl Default for Recycler {
    #[inline]
    fn default() -> Self {
        Self::new(32)
    }
}

impl fmt::Debug for Recycler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Recycler")
            .field("free", &self.free.len())
            .finish()
    }
}

impl Pool for Recycler {
    #[inline]
    fn take(&self, capacity: usize) -> Vec<u8> {
        if let Some(mut buffer) = self.free.pop() {
            // Only reuse an allocation that is already large enough;
            // undersized ones are dropped rather than pushed back.
            if buffer.capacity() >= capacity {
                buffer.resize(capacity, 0);
                return buffer;
            }
        }

        vec![0; capacity]
    }

    #[inline]
    fn give(&self, buffer: Vec<u8>) {
        let _ = self.free.push(buffer);
    }
}
