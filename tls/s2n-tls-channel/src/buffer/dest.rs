// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use std::io::IoSliceMut;

/// Scatter view over caller destination memory: one cursor across a set of
/// mutable slices.
///
/// Engines check `remaining` before unwrapping a record and report overflow
/// instead of writing partial plaintext, so `put_slice` treats running out
/// of space as a contract violation.
pub struct Dest<'a, 'b> {
    bufs: &'a mut [IoSliceMut<'b>],
    idx: usize,
    off: usize,
    written: usize,
}

impl fmt::Debug for Dest<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dest")
            .field("remaining", &self.remaining())
            .field("written", &self.written)
            .finish()
    }
}

impl<'a, 'b> Dest<'a, 'b> {
    pub fn new(bufs: &'a mut [IoSliceMut<'b>]) -> Self {
        let mut dest = Self {
            bufs,
            idx: 0,
            off: 0,
            written: 0,
        };
        dest.skip_full();
        dest
    }

    pub fn remaining(&self) -> usize {
        let ahead: usize = self.bufs[self.idx..].iter().map(|buf| buf.len()).sum();
        ahead - self.off
    }

    pub fn has_remaining(&self) -> bool {
        self.idx < self.bufs.len()
    }

    /// Bytes written through this view so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Copies all of `src` in, advancing the cursor.
    ///
    /// # Panics
    ///
    /// Panics when `src` exceeds `remaining`.
    pub fn put_slice(&mut self, mut src: &[u8]) {
        assert!(
            src.len() <= self.remaining(),
            "destination overflow: engine wrote past the space it was offered"
        );
        self.written += src.len();
        while !src.is_empty() {
            let buf = &mut self.bufs[self.idx][self.off..];
            let n = buf.len().min(src.len());
            buf[..n].copy_from_slice(&src[..n]);
            src = &src[n..];
            self.off += n;
            self.skip_full();
        }
    }

    fn skip_full(&mut self) {
        while self
            .bufs
            .get(self.idx)
            .is_some_and(|buf| buf.len() == self.off)
        {
            self.idx += 1;
            self.off = 0;
        }
    }
}
