//! The transport collaborator: tagged point-to-point messages between PEs.
//!
//! Every split and collective in this crate is built from four primitives
//! supplied by a [`Transport`]: an eager `send`, a matching blocking `recv`,
//! a world-wide `barrier` and a coordinated `abort`. The crate ships one
//! implementation, [`LocalTransport`](crate::LocalTransport), which simulates
//! a job as one thread per PE.

use crate::context::ProcessContext;
use crate::error::Result;

/// Context id reserved for the transport's own world barrier.
pub const BARRIER_CONTEXT: u64 = 0;

/// Message tag.
///
/// `context` identifies the team, `seq` the collective issued on it and
/// `round` the step within that collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Team context id, identical on every member of the team.
    pub context: u64,
    /// Per-team collective sequence number.
    pub seq: u64,
    /// Step within the collective.
    pub round: u32,
}

impl Tag {
    /// Create a tag.
    pub fn new(context: u64, seq: u64, round: u32) -> Self {
        Tag {
            context,
            seq,
            round,
        }
    }
}

/// Message passing between the PEs of one job.
///
/// # Contract
///
/// - `send` is eager: it must not wait for the matching `recv`.
/// - Two messages from the same source with the same tag are received in the
///   order they were sent.
/// - After any PE calls `abort`, blocked and future `recv` calls on every PE
///   return [`Error::Aborted`](crate::Error::Aborted).
pub trait Transport {
    /// Rank and size of the calling PE.
    fn context(&self) -> ProcessContext;

    /// Send `payload` to global rank `dest`.
    fn send(&self, dest: i32, tag: Tag, payload: Vec<u8>) -> Result<()>;

    /// Block until a message from global rank `src` with `tag` arrives.
    fn recv(&self, src: i32, tag: Tag) -> Result<Vec<u8>>;

    /// Full barrier over every PE of the job.
    fn barrier(&self) -> Result<()>;

    /// Tell every PE the job is over. Idempotent.
    fn abort(&self, reason: &str);
}
