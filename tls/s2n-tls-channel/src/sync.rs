// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lock primitives for the channel's three critical sections.
//!
//! The channel is generic over a [`lock_api::RawMutex`] so callers can swap
//! the locking primitive the same way the rest of the stack swaps sync
//! primitives for testing. The default is [`parking_lot::RawMutex`]; a
//! single-threaded caller can opt out of locking entirely with
//! [`SingleThreaded`].

use core::cell::Cell;
pub use parking_lot::lock_api;
pub use parking_lot::RawMutex as DefaultRawMutex;

pub(crate) type Lock<L, T> = lock_api::Mutex<L, T>;

/// A no-op lock for single-threaded use.
///
/// Contains a `Cell`, so any channel built on it is `!Sync` and can never be
/// shared across threads; within one thread the "lock" reduces to a reentry
/// check. Lock and unlock compile down to a flag flip.
pub struct SingleThreaded {
    locked: Cell<bool>,
}

unsafe impl lock_api::RawMutex for SingleThreaded {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: Cell::new(false),
    };

    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        assert!(
            !self.locked.replace(true),
            "single-threaded lock acquired reentrantly"
        );
    }

    fn try_lock(&self) -> bool {
        !self.locked.replace(true)
    }

    unsafe fn unlock(&self) {
        self.locked.set(false);
    }
}
