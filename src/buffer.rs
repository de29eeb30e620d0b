//! Caller-owned scratch buffers for team reductions.
//!
//! Every reduction takes a [`WorkBuffer`] and a [`SyncBuffer`]. They are
//! allocated once by the caller and reused across collectives, but never
//! while a previous collective on them is still running on any PE. The engine
//! tracks that with a claim token: a buffer bound to a collective that did not
//! complete is rejected with [`Error::ProtocolViolation`] until it is reset.
//!
//! # Example
//!
//! ```
//! use ferroteam::{SyncBuffer, WorkBuffer, SYNC_VALUE};
//!
//! let sync = SyncBuffer::new();
//! assert!(sync.is_idle());
//! assert!(sync.snapshot().iter().all(|&v| v == SYNC_VALUE));
//!
//! let work: WorkBuffer<i64> = WorkBuffer::for_nreduce(100);
//! assert_eq!(work.len(), 51);
//! ```

use crate::datatype::TeamDatatype;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicI64, Ordering};

/// Value every [`SyncBuffer`] slot must hold before a collective starts.
pub const SYNC_VALUE: i64 = -1;

/// Number of slots a reduction needs in its [`SyncBuffer`].
pub const REDUCE_SYNC_SIZE: usize = 4;

/// Lower bound on the element count of a [`WorkBuffer`].
pub const MIN_WORK_SIZE: usize = 16;

const SLOT_TOKEN: usize = 0;
const SLOT_ROUND: usize = 1;
const SLOT_OFFSET: usize = 2;

/// Work buffer elements needed to reduce `nreduce` values:
/// `max(nreduce / 2 + 1, MIN_WORK_SIZE)`.
pub fn work_size_for(nreduce: usize) -> usize {
    (nreduce / 2 + 1).max(MIN_WORK_SIZE)
}

/// Synchronization scratch for one collective at a time.
///
/// Slots are atomics so a buffer can be shared (for instance behind an `Arc`)
/// and a second collective racing on it is caught instead of corrupting the
/// first. While bound, slot 0 holds the claim token, slot 1 the current round
/// and slot 2 the offset of the chunk in flight.
#[derive(Debug)]
pub struct SyncBuffer {
    slots: Box<[AtomicI64]>,
}

impl SyncBuffer {
    /// A buffer of [`REDUCE_SYNC_SIZE`] slots, all at [`SYNC_VALUE`].
    pub fn new() -> Self {
        Self::with_len(REDUCE_SYNC_SIZE)
    }

    /// A buffer of `len` slots, all at [`SYNC_VALUE`].
    pub fn with_len(len: usize) -> Self {
        SyncBuffer {
            slots: (0..len).map(|_| AtomicI64::new(SYNC_VALUE)).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the buffer has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether every slot holds [`SYNC_VALUE`].
    pub fn is_idle(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.load(Ordering::Acquire) == SYNC_VALUE)
    }

    /// Current slot values.
    pub fn snapshot(&self) -> Vec<i64> {
        self.slots.iter().map(|s| s.load(Ordering::Acquire)).collect()
    }

    /// Overwrite one slot. Out-of-range slots are ignored.
    pub fn set(&self, slot: usize, value: i64) {
        if let Some(s) = self.slots.get(slot) {
            s.store(value, Ordering::Release);
        }
    }

    /// Put every slot back to [`SYNC_VALUE`].
    ///
    /// Only needed after a collective failed part way; successful collectives
    /// restore the buffer themselves.
    pub fn reset(&self) {
        for s in self.slots.iter() {
            s.store(SYNC_VALUE, Ordering::Release);
        }
    }

    /// Bind the buffer to the collective identified by `token` (`token >= 0`).
    pub(crate) fn claim(&self, token: i64) -> Result<SyncClaim<'_>> {
        if self.slots.len() < REDUCE_SYNC_SIZE {
            return Err(Error::invalid(format!(
                "sync buffer has {} slots, need {REDUCE_SYNC_SIZE}",
                self.slots.len()
            )));
        }
        if let Err(owner) = self.slots[SLOT_TOKEN].compare_exchange(
            SYNC_VALUE,
            token,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(Error::protocol(format!(
                "sync buffer still bound to collective {owner}"
            )));
        }
        for (i, s) in self.slots.iter().enumerate().skip(1) {
            let v = s.load(Ordering::Acquire);
            if v != SYNC_VALUE {
                self.slots[SLOT_TOKEN].store(SYNC_VALUE, Ordering::Release);
                return Err(Error::protocol(format!(
                    "sync slot {i} holds {v}, expected SYNC_VALUE ({SYNC_VALUE})"
                )));
            }
        }
        Ok(SyncClaim { buf: self })
    }
}

impl Default for SyncBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`SyncBuffer`] bound to an in-flight collective.
///
/// Dropping a claim without [`release`](Self::release) leaves the buffer bound,
/// which is what a collective that failed part way should do.
#[derive(Debug)]
pub(crate) struct SyncClaim<'a> {
    buf: &'a SyncBuffer,
}

impl SyncClaim<'_> {
    /// Record the round and chunk offset in flight.
    pub(crate) fn progress(&self, round: u32, offset: usize) {
        self.buf.slots[SLOT_ROUND].store(i64::from(round), Ordering::Release);
        self.buf.slots[SLOT_OFFSET].store(offset as i64, Ordering::Release);
    }

    /// The collective completed: restore every slot to [`SYNC_VALUE`].
    pub(crate) fn release(self) {
        self.buf.slots[SLOT_OFFSET].store(SYNC_VALUE, Ordering::Release);
        self.buf.slots[SLOT_ROUND].store(SYNC_VALUE, Ordering::Release);
        self.buf.slots[SLOT_TOKEN].store(SYNC_VALUE, Ordering::Release);
    }
}

/// Staging area for peer contributions during a reduction.
///
/// Must hold at least [`work_size_for`]`(nreduce)` elements.
#[derive(Debug, Clone)]
pub struct WorkBuffer<T: TeamDatatype> {
    data: Vec<T>,
    bound: bool,
}

impl<T: TeamDatatype> WorkBuffer<T> {
    /// A zero-filled buffer of `len` elements.
    pub fn new(len: usize) -> Self {
        WorkBuffer {
            data: vec![T::ZERO; len],
            bound: false,
        }
    }

    /// The smallest buffer valid for reducing `nreduce` elements.
    pub fn for_nreduce(nreduce: usize) -> Self {
        Self::new(work_size_for(nreduce))
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer has no capacity.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether a collective that did not complete still owns the buffer.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Release the buffer after a failed collective.
    pub fn reset(&mut self) {
        self.bound = false;
    }

    /// Current contents.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Check capacity for `nreduce` elements and bind the buffer.
    pub(crate) fn bind(&mut self, nreduce: usize) -> Result<()> {
        if self.bound {
            return Err(Error::protocol(
                "work buffer still bound to an incomplete collective",
            ));
        }
        let required = work_size_for(nreduce);
        if self.data.len() < required {
            return Err(Error::invalid(format!(
                "work buffer holds {} elements, need {required} for nreduce = {nreduce}",
                self.data.len()
            )));
        }
        self.bound = true;
        Ok(())
    }

    /// Scratch space for `len` incoming elements.
    pub(crate) fn scratch(&mut self, len: usize) -> &mut [T] {
        &mut self.data[..len]
    }

    pub(crate) fn unbind(&mut self) {
        self.bound = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_sizes() {
        assert_eq!(work_size_for(0), MIN_WORK_SIZE);
        assert_eq!(work_size_for(3), MIN_WORK_SIZE);
        assert_eq!(work_size_for(30), 16);
        assert_eq!(work_size_for(31), 16);
        assert_eq!(work_size_for(32), 17);
        assert_eq!(work_size_for(1000), 501);
    }

    #[test]
    fn claim_and_release() {
        let sync = SyncBuffer::new();
        let claim = sync.claim(7).unwrap();
        claim.progress(2, 16);
        assert_eq!(sync.snapshot(), vec![7, 2, 16, SYNC_VALUE]);
        assert!(!sync.is_idle());
        claim.release();
        assert!(sync.is_idle());
    }

    #[test]
    fn second_claim_is_a_protocol_violation() {
        let sync = SyncBuffer::new();
        let _first = sync.claim(1).unwrap();
        match sync.claim(2) {
            Err(Error::ProtocolViolation(msg)) => assert!(msg.contains("collective 1")),
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn abandoned_claim_poisons_until_reset() {
        let sync = SyncBuffer::new();
        drop(sync.claim(3).unwrap());
        assert!(matches!(sync.claim(4), Err(Error::ProtocolViolation(_))));
        sync.reset();
        assert!(sync.claim(4).is_ok());
    }

    #[test]
    fn uninitialized_slot_is_rejected() {
        let sync = SyncBuffer::new();
        sync.set(3, 0);
        assert!(matches!(sync.claim(0), Err(Error::ProtocolViolation(_))));
        // The failed claim did not leave the token behind.
        assert_eq!(sync.snapshot()[0], SYNC_VALUE);
    }

    #[test]
    fn short_sync_buffer() {
        let sync = SyncBuffer::with_len(2);
        assert!(matches!(sync.claim(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn concurrent_claims_admit_one() {
        use std::sync::{Arc, Barrier};
        let sync = Arc::new(SyncBuffer::new());
        let gate = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sync = Arc::clone(&sync);
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    gate.wait();
                    // Leak the claim so the winner keeps the buffer bound.
                    sync.claim(i).map(std::mem::forget).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn work_buffer_binding() {
        let mut work: WorkBuffer<i32> = WorkBuffer::new(16);
        assert!(matches!(work.bind(40), Err(Error::InvalidArgument(_))));
        assert!(!work.is_bound());
        work.bind(30).unwrap();
        assert!(matches!(work.bind(30), Err(Error::ProtocolViolation(_))));
        work.reset();
        work.bind(30).unwrap();
        work.unbind();
        assert!(!work.is_bound());
    }
}
