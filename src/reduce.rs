//! Team-scoped all-reduce.
//!
//! Every member ends up with the element-wise reduction of all members'
//! sources. The exchange follows [`schedule::recursive_doubling`]; each step
//! moves one chunk of at most [`work_size_for`]`(nreduce)` elements, staged in
//! the caller's [`WorkBuffer`] before it is combined. The chunk size only
//! depends on `nreduce`, so members with differently sized work buffers still
//! cut the data the same way.
//!
//! Every message starts with a fixed header naming the element type, the
//! operator, `nreduce` and the chunk offset. A member that disagrees on any of
//! them is caught by the first peer it talks to.

use crate::buffer::{work_size_for, SyncBuffer, WorkBuffer};
use crate::datatype::{decode_into, encode_slice, TeamDatatype};
use crate::error::{Error, Result};
use crate::schedule::{self, Action};
use crate::team::Team;
use crate::transport::{Tag, Transport};
use crate::{Pe, ReduceOp};
use std::fmt;
use tracing::{debug, trace};

const HEADER_LEN: usize = 18;

/// Bits of the message round reserved for the schedule step.
const STEP_BITS: u32 = 8;

/// What a reduction message claims to be part of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    datatype: u8,
    op: u8,
    nreduce: u64,
    offset: u64,
}

impl Header {
    fn new<D: TeamDatatype>(op: ReduceOp, nreduce: usize, offset: usize) -> Self {
        Header {
            datatype: D::TAG as u8,
            op: op as u8,
            nreduce: nreduce as u64,
            offset: offset as u64,
        }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.datatype;
        out[1] = self.op;
        out[2..10].copy_from_slice(&self.nreduce.to_le_bytes());
        out[10..18].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let head = bytes.get(..HEADER_LEN)?;
        let word = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&head[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Some(Header {
            datatype: head[0],
            op: head[1],
            nreduce: word(2),
            offset: word(10),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(type tag {}, op {}, nreduce {}, offset {})",
            self.datatype, self.op, self.nreduce, self.offset
        )
    }
}

impl<T: Transport> Pe<T> {
    /// Reduce `source` element-wise with `op` over every member of `team` and
    /// deposit the result in `dest` on every member.
    ///
    /// `dest` and `source` must have the same length, and that length must
    /// agree across members. `work` needs at least
    /// [`work_size_for`]`(source.len())` elements; `sync` must be idle. Both
    /// are bound for the duration of the call and must not be reused by
    /// another collective until every member has returned (see
    /// [`Pe::barrier_all`]).
    ///
    /// Results are bit-identical on every member, floating point included.
    ///
    /// # Errors
    ///
    /// - [`Error::NotMember`] for [`Team::NULL`]
    /// - [`Error::InvalidArgument`] for a bitwise `op` on a float type, a
    ///   length mismatch (local or across members), or a short work buffer
    /// - [`Error::ProtocolViolation`] if either buffer is still bound to an
    ///   incomplete collective
    ///
    /// All of them are fatal to the job.
    pub fn reduce_to_all<D: TeamDatatype>(
        &mut self,
        team: Team,
        op: ReduceOp,
        dest: &mut [D],
        source: &[D],
        work: &mut WorkBuffer<D>,
        sync: &SyncBuffer,
    ) -> Result<()> {
        let result = if dest.len() == source.len() {
            self.reduce_inner(team, op, dest, Some(source), work, sync)
        } else {
            Err(Error::invalid(format!(
                "dest holds {} elements, source {}",
                dest.len(),
                source.len()
            )))
        };
        result.map_err(|e| self.fail(e))
    }

    /// [`reduce_to_all`](Self::reduce_to_all) with `dest` and `source` being
    /// the same buffer.
    pub fn reduce_to_all_in_place<D: TeamDatatype>(
        &mut self,
        team: Team,
        op: ReduceOp,
        data: &mut [D],
        work: &mut WorkBuffer<D>,
        sync: &SyncBuffer,
    ) -> Result<()> {
        let result = self.reduce_inner(team, op, data, None, work, sync);
        result.map_err(|e| self.fail(e))
    }

    fn reduce_inner<D: TeamDatatype>(
        &mut self,
        team: Team,
        op: ReduceOp,
        data: &mut [D],
        source: Option<&[D]>,
        work: &mut WorkBuffer<D>,
        sync: &SyncBuffer,
    ) -> Result<()> {
        let view = self.registry.begin_collective(team)?;
        if !D::supports(op) {
            return Err(Error::invalid(format!(
                "{op:?} is not defined for {:?} elements",
                D::TAG
            )));
        }
        let nreduce = data.len();
        work.bind(nreduce)?;
        let claim = sync.claim(view.seq as i64)?;
        // `dest` is only touched once the call has been accepted.
        if let Some(source) = source {
            data.copy_from_slice(source);
        }

        let steps = schedule::recursive_doubling(view.my_rank, view.size());
        let chunk = work_size_for(nreduce);
        // An empty reduction still exchanges one header so a peer with a
        // different nreduce is caught.
        let chunks = nreduce.div_ceil(chunk).max(1);
        debug!(
            pe = self.my_pe(),
            ?team,
            ?op,
            nreduce,
            chunks,
            size = view.size(),
            "reduce to all"
        );

        for index in 0..chunks {
            let offset = index * chunk;
            let end = (offset + chunk).min(nreduce);
            let block = &mut data[offset..end];
            let header = Header::new::<D>(op, nreduce, offset);

            for step in &steps {
                claim.progress(step.round, offset);
                let tag = view.tag(((index as u32) << STEP_BITS) | step.round);
                let peer = view.global(step.action.peer());
                trace!(pe = self.my_pe(), action = ?step.action, offset, "reduce step");

                match step.action {
                    Action::FoldSend(_) | Action::UnfoldSend(_) => {
                        self.transport
                            .send(peer, tag, encode_slice(&header.encode(), block))?;
                    }
                    Action::FoldRecv(_) => {
                        let incoming = work.scratch(block.len());
                        self.recv_chunk(peer, tag, &header, incoming)?;
                        // The folded rank is always the higher one.
                        for (mine, &theirs) in block.iter_mut().zip(incoming.iter()) {
                            *mine = D::combine(op, *mine, theirs);
                        }
                    }
                    Action::Exchange(partner) => {
                        self.transport
                            .send(peer, tag, encode_slice(&header.encode(), block))?;
                        let incoming = work.scratch(block.len());
                        self.recv_chunk(peer, tag, &header, incoming)?;
                        let lower_first = view.my_rank < partner;
                        for (mine, &theirs) in block.iter_mut().zip(incoming.iter()) {
                            *mine = if lower_first {
                                D::combine(op, *mine, theirs)
                            } else {
                                D::combine(op, theirs, *mine)
                            };
                        }
                    }
                    Action::UnfoldRecv(_) => {
                        let incoming = work.scratch(block.len());
                        self.recv_chunk(peer, tag, &header, incoming)?;
                        block.copy_from_slice(incoming);
                    }
                }
            }
        }

        claim.release();
        work.unbind();
        Ok(())
    }

    /// Receive one chunk from `from` into `out`, checking its header.
    fn recv_chunk<D: TeamDatatype>(
        &self,
        from: i32,
        tag: Tag,
        expected: &Header,
        out: &mut [D],
    ) -> Result<()> {
        let bytes = self.transport.recv(from, tag)?;
        let theirs = Header::decode(&bytes).ok_or_else(|| {
            Error::protocol(format!(
                "PE {from} sent a {}-byte reduction message, shorter than its header",
                bytes.len()
            ))
        })?;
        if theirs != *expected {
            return Err(Error::invalid(format!(
                "reduction arguments differ: PE {from} sent {theirs}, PE {} expected {expected}",
                self.my_pe()
            )));
        }
        if !decode_into(&bytes[HEADER_LEN..], out) {
            return Err(Error::protocol(format!(
                "PE {from} sent {} payload bytes for {} elements",
                bytes.len() - HEADER_LEN,
                out.len()
            )));
        }
        Ok(())
    }
}

macro_rules! reduce_shorthands {
    ($($name:ident => $op:ident, $what:literal;)*) => {
        impl<T: Transport> Pe<T> {
            $(
                #[doc = concat!("Element-wise ", $what, " of `source` over `team`, into `dest` on every member.")]
                ///
                /// See [`reduce_to_all`](Self::reduce_to_all).
                pub fn $name<D: TeamDatatype>(
                    &mut self,
                    team: Team,
                    dest: &mut [D],
                    source: &[D],
                    work: &mut WorkBuffer<D>,
                    sync: &SyncBuffer,
                ) -> Result<()> {
                    self.reduce_to_all(team, ReduceOp::$op, dest, source, work, sync)
                }
            )*
        }
    };
}

reduce_shorthands! {
    or_to_all => Or, "bitwise OR";
    and_to_all => And, "bitwise AND";
    xor_to_all => Xor, "bitwise XOR";
    sum_to_all => Sum, "sum";
    prod_to_all => Prod, "product";
    min_to_all => Min, "minimum";
    max_to_all => Max, "maximum";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, LocalWorld, SYNC_VALUE};
    use std::time::Duration;

    fn world(npes: i32) -> LocalWorld {
        LocalWorld::new(npes)
            .unwrap()
            .with_config(Config::default().with_recv_timeout(Duration::from_secs(10)))
    }

    #[test]
    fn header_codec() {
        let h = Header::new::<i32>(ReduceOp::Or, 40, 21);
        assert_eq!(Header::decode(&h.encode()), Some(h));
        assert_eq!(Header::decode(&[0u8; HEADER_LEN - 1]), None);
        assert_ne!(h, Header::new::<i64>(ReduceOp::Or, 40, 21));
        assert_ne!(h, Header::new::<i32>(ReduceOp::And, 40, 21));
        assert_ne!(h, Header::new::<i32>(ReduceOp::Or, 41, 21));
    }

    #[test]
    fn or_replicates_on_every_member() {
        let results = world(4).run(|pe| {
            let source = [(pe.my_pe() + 1) % 4; 3];
            let mut dest = [0i32; 3];
            let mut work = WorkBuffer::for_nreduce(3);
            let sync = SyncBuffer::new();
            pe.or_to_all(Team::WORLD, &mut dest, &source, &mut work, &sync)?;
            assert!(sync.is_idle());
            assert!(!work.is_bound());
            Ok(dest)
        });
        for dest in results {
            assert_eq!(dest.unwrap(), [3, 3, 3]);
        }
    }

    #[test]
    fn single_member_team_copies_source() {
        let results = world(1).run(|pe| {
            let mut data = [5u64, 6, 7];
            let mut work = WorkBuffer::for_nreduce(3);
            let sync = SyncBuffer::new();
            pe.reduce_to_all_in_place(Team::WORLD, ReduceOp::Prod, &mut data, &mut work, &sync)?;
            Ok(data)
        });
        assert_eq!(results[0].as_ref().unwrap(), &[5, 6, 7]);
    }

    #[test]
    fn float_sums_are_bit_identical() {
        let results = world(7).run(|pe| {
            let me = f64::from(pe.my_pe());
            let source: Vec<f64> = (0..40).map(|i| 0.1 * me + 1e-9 * f64::from(i)).collect();
            let mut dest = vec![0.0; 40];
            let mut work = WorkBuffer::for_nreduce(40);
            let sync = SyncBuffer::new();
            pe.sum_to_all(Team::WORLD, &mut dest, &source, &mut work, &sync)?;
            Ok(dest)
        });
        let first: Vec<u64> = results[0].as_ref().unwrap().iter().map(|v| v.to_bits()).collect();
        for r in &results {
            let bits: Vec<u64> = r.as_ref().unwrap().iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits, first);
        }
    }

    #[test]
    fn bitwise_on_floats_is_rejected() {
        let results = world(2).run(|pe| {
            let mut dest = [0.0f32; 2];
            let mut work = WorkBuffer::for_nreduce(2);
            let sync = SyncBuffer::new();
            pe.or_to_all(Team::WORLD, &mut dest, &[1.0, 2.0], &mut work, &sync)
        });
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::InvalidArgument(_)))));
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[test]
    fn bound_sync_buffer_is_a_protocol_violation() {
        let results = world(1).run(|pe| {
            let mut dest = [0i32; 4];
            let mut work = WorkBuffer::for_nreduce(4);
            let sync = SyncBuffer::new();
            // A collective that never completed still owns the buffer.
            sync.set(0, 17);
            let err = pe
                .or_to_all(Team::WORLD, &mut dest, &[1, 2, 3, 4], &mut work, &sync)
                .unwrap_err();
            Ok((err, sync.snapshot()[0]))
        });
        let (err, token) = results.into_iter().next().unwrap().unwrap();
        assert!(matches!(err, Error::ProtocolViolation(_)), "{err:?}");
        assert_eq!(token, 17);
    }

    #[test]
    fn mismatched_lengths_are_caught() {
        let results = world(3).run(|pe| {
            let n = if pe.my_pe() == 1 { 5 } else { 4 };
            let source = vec![1i64; n];
            let mut dest = vec![0i64; n];
            let mut work = WorkBuffer::for_nreduce(n);
            let sync = SyncBuffer::new();
            pe.sum_to_all(Team::WORLD, &mut dest, &source, &mut work, &sync)
        });
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::InvalidArgument(_)))));
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[test]
    fn failed_reduction_leaves_buffers_bound() {
        let results = world(2).run(|pe| {
            let mut dest = [0i32; 1];
            let mut work = WorkBuffer::for_nreduce(1);
            let sync = SyncBuffer::new();
            let source = [pe.my_pe()];
            if pe.my_pe() == 0 {
                pe.abort("peer gave up");
            }
            let outcome = pe.or_to_all(Team::WORLD, &mut dest, &source, &mut work, &sync);
            Ok((outcome.is_err(), work.is_bound(), sync.snapshot()[0] != SYNC_VALUE))
        });
        for r in results {
            assert_eq!(r.unwrap(), (true, true, true));
        }
    }

    #[test]
    fn rejected_call_leaves_dest_alone() {
        let results = world(1).run(|pe| {
            let mut work = WorkBuffer::for_nreduce(2);
            let sync = SyncBuffer::new();

            let mut on_null = [42i32, 42];
            let null = pe.or_to_all(Team::NULL, &mut on_null, &[1, 2], &mut work, &sync);

            let mut short = [42i32, 42];
            let mut tiny = WorkBuffer::new(1);
            let cramped = pe.or_to_all(Team::WORLD, &mut short, &[1, 2], &mut tiny, &sync);

            let mut busy = [42i32, 42];
            sync.set(0, 5);
            let bound = pe.or_to_all(Team::WORLD, &mut busy, &[1, 2], &mut work, &sync);

            Ok((
                matches!(null, Err(Error::NotMember)),
                matches!(cramped, Err(Error::InvalidArgument(_))),
                matches!(bound, Err(Error::ProtocolViolation(_))),
                [on_null, short, busy],
            ))
        });
        let (null, cramped, bound, dests) = results.into_iter().next().unwrap().unwrap();
        assert!(null && cramped && bound);
        assert_eq!(dests, [[42, 42]; 3]);
    }

    #[test]
    fn local_length_mismatch() {
        let results = world(1).run(|pe| {
            let mut dest = [0u8; 2];
            let mut work = WorkBuffer::for_nreduce(3);
            let sync = SyncBuffer::new();
            pe.max_to_all(Team::WORLD, &mut dest, &[1, 2, 3], &mut work, &sync)
        });
        assert!(matches!(results[0], Err(Error::InvalidArgument(_))));
    }
}
