//! # ferroteam
//!
//! PE teams for SPMD programs.
//!
//! A job is a fixed set of processing elements (PEs), each knowing its global
//! rank. This crate partitions them into ranked subgroups and runs reductions
//! scoped to one subgroup:
//! - Strided splits (`start`, `stride`, `size` triplets)
//! - Color/key splits, one team per distinct color
//! - 2D and 3D cartesian splits, one team per axis
//! - Team-scoped reductions over caller-supplied work/sync buffers
//!
//! Bytes move through a [`Transport`]. [`LocalWorld`] provides one that runs
//! every PE as a thread of the current process.
//!
//! ## Quick Start
//!
//! ```
//! use ferroteam::{LocalWorld, SyncBuffer, Team, WorkBuffer};
//!
//! let world = LocalWorld::new(4).unwrap();
//! let results = world.run(|pe| {
//!     let source = [(pe.my_pe() + 1) % 4; 3];
//!     let mut dest = [0i32; 3];
//!     let mut work = WorkBuffer::for_nreduce(3);
//!     let sync = SyncBuffer::new();
//!
//!     pe.barrier_all()?;
//!     pe.or_to_all(Team::WORLD, &mut dest, &source, &mut work, &sync)?;
//!     Ok(dest)
//! });
//! for dest in results {
//!     assert_eq!(dest.unwrap(), [3, 3, 3]);
//! }
//! ```
//!
//! ## Supported Types
//!
//! Reductions are generic over [`TeamDatatype`]:
//! `i16`, `i32`, `i64`, `u8`, `u32`, `u64`, `f32`, `f64`.
//!
//! ## Errors
//!
//! Faults detected inside a split or collective are fatal to the job. The
//! detecting PE logs the fault, aborts every peer through the transport and
//! returns the error; peers blocked in the same collective return
//! [`Error::Aborted`].

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

mod buffer;
mod collective;
mod config;
mod context;
mod datatype;
mod error;
mod local;
mod reduce;
pub mod schedule;
mod split;
mod team;
mod transport;

pub use buffer::{work_size_for, SyncBuffer, WorkBuffer, MIN_WORK_SIZE, REDUCE_SYNC_SIZE, SYNC_VALUE};
pub use config::{Config, DEFAULT_MAX_TEAMS};
pub use context::ProcessContext;
pub use datatype::{DatatypeTag, TeamDatatype};
pub use error::{Error, Result};
pub use local::{LocalTransport, LocalWorld};
pub use split::COLOR_UNDEFINED;
pub use team::{Team, TeamId};
pub use transport::{Tag, Transport, BARRIER_CONTEXT};

use std::marker::PhantomData;
use team::{TeamRegistry, WORLD_CONTEXT};
use tracing::{debug, error};

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
    /// Bitwise AND (integers only)
    And = 4,
    /// Bitwise OR (integers only)
    Or = 5,
    /// Bitwise XOR (integers only)
    Xor = 6,
}

impl ReduceOp {
    /// Whether this operator is only defined for integer types.
    pub fn is_bitwise(self) -> bool {
        matches!(self, ReduceOp::And | ReduceOp::Or | ReduceOp::Xor)
    }
}

/// The calling PE.
///
/// Owns the transport endpoint and the registry of teams this PE belongs to.
/// Every split, query and collective is a method on it. `Pe` is neither `Send`
/// nor `Sync`: a PE is a single thread of execution.
///
/// # Example
///
/// ```
/// use ferroteam::{Config, LocalWorld, Pe};
///
/// let world = LocalWorld::new(2).unwrap();
/// let transport = world.transports().remove(1);
/// let pe = Pe::new(transport, Config::default()).unwrap();
/// assert_eq!((pe.my_pe(), pe.n_pes()), (1, 2));
/// ```
pub struct Pe<T: Transport> {
    transport: T,
    ctx: ProcessContext,
    config: Config,
    registry: TeamRegistry,
    /// Marker to make Pe !Send and !Sync
    _marker: PhantomData<*const ()>,
}

impl<T: Transport> Pe<T> {
    /// Set up the calling PE with configuration from the environment.
    ///
    /// See [`Config::from_env`].
    pub fn init(transport: T) -> Result<Self> {
        Self::new(transport, Config::from_env())
    }

    /// Set up the calling PE and register [`Team::WORLD`].
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] if `config.max_teams` is zero.
    pub fn new(transport: T, config: Config) -> Result<Self> {
        let ctx = transport.context();
        let mut registry = TeamRegistry::new(config.max_teams);
        registry.register((0..ctx.npes()).collect(), ctx.rank(), Team::NULL, WORLD_CONTEXT)?;
        debug!(pe = ctx.rank(), npes = ctx.npes(), ?config, "pe initialized");
        Ok(Pe {
            transport,
            ctx,
            config,
            registry,
            _marker: PhantomData,
        })
    }

    /// Global rank of the calling PE.
    pub fn my_pe(&self) -> i32 {
        self.ctx.rank()
    }

    /// Number of PEs in the job.
    pub fn n_pes(&self) -> i32 {
        self.ctx.npes()
    }

    /// Rank and size of the calling PE.
    pub fn context(&self) -> ProcessContext {
        self.ctx
    }

    /// The configuration this PE was set up with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying transport endpoint.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Full barrier over every PE of the job.
    ///
    /// Use it to make sure buffers from a previous collective are free on all
    /// PEs before reusing them.
    pub fn barrier_all(&self) -> Result<()> {
        self.transport.barrier()
    }

    /// Abort the whole job.
    pub fn abort(&self, reason: &str) {
        self.transport.abort(reason);
    }

    /// Log a fault raised inside a collective and abort every peer.
    ///
    /// Errors relayed from another PE's abort are passed through untouched.
    pub(crate) fn fail(&self, err: Error) -> Error {
        if !err.is_relayed() {
            error!(pe = self.my_pe(), %err, "fatal team fault, aborting job");
            self.transport.abort(&err.to_string());
        }
        err
    }
}

// Pe is not Send or Sync - one PE is one thread of execution.
// This is enforced by PhantomData<*const ()> in the struct

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitwise_ops() {
        assert!(ReduceOp::Or.is_bitwise());
        assert!(ReduceOp::And.is_bitwise());
        assert!(ReduceOp::Xor.is_bitwise());
        assert!(!ReduceOp::Sum.is_bitwise());
        assert!(!ReduceOp::Max.is_bitwise());
    }

    #[test]
    fn pe_registers_world() {
        let world = LocalWorld::new(3).unwrap();
        let transport = world.transports().remove(2);
        let pe = Pe::new(transport, Config::default()).unwrap();
        assert_eq!(pe.team_size(Team::WORLD).unwrap(), 3);
        assert_eq!(pe.team_rank(Team::WORLD).unwrap(), 2);
        assert_eq!(pe.team_members(Team::WORLD).unwrap(), &[0, 1, 2]);
        assert_eq!(pe.team_parent(Team::WORLD).unwrap(), Team::NULL);
        assert_eq!(pe.live_teams(), 1);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let world = LocalWorld::new(1).unwrap();
        let transport = world.transports().remove(0);
        assert!(matches!(
            Pe::new(transport, Config::default().with_max_teams(0)),
            Err(Error::ResourceExhausted { capacity: 0 })
        ));
    }
}
