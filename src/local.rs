//! In-process transport: one thread per PE, channels in between.
//!
//! [`LocalWorld`] stands in for a process launcher. It wires up `npes`
//! [`LocalTransport`]s and [`LocalWorld::run`] executes an SPMD closure on each
//! of them, which is how the tests and demos of this crate drive real splits
//! and reductions without a multi-process runtime.
//!
//! # Example
//!
//! ```
//! use ferroteam::{LocalWorld, Team};
//!
//! let world = LocalWorld::new(4).unwrap();
//! let sizes = world.run(|pe| {
//!     let evens = pe.split_strided(Team::WORLD, 0, 2, 2)?;
//!     if evens.is_null() {
//!         return Ok(0);
//!     }
//!     pe.team_size(evens)
//! });
//! let sizes: Vec<i32> = sizes.into_iter().map(|r| r.unwrap()).collect();
//! assert_eq!(sizes, vec![2, 0, 2, 0]);
//! ```

use crate::config::Config;
use crate::context::ProcessContext;
use crate::error::{Error, Result};
use crate::schedule;
use crate::transport::{Tag, Transport, BARRIER_CONTEXT};
use crate::Pe;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, trace, warn};

enum Body {
    Data(Vec<u8>),
    Abort(String),
}

struct Envelope {
    src: i32,
    tag: Tag,
    body: Body,
}

/// One PE's endpoint in a [`LocalWorld`].
///
/// Unmatched messages are parked until a `recv` asks for their `(source, tag)`.
pub struct LocalTransport {
    ctx: ProcessContext,
    peers: Arc<[Sender<Envelope>]>,
    inbox: Receiver<Envelope>,
    parked: RefCell<VecDeque<(i32, Tag, Vec<u8>)>>,
    aborted: RefCell<Option<Error>>,
    barrier_epoch: Cell<u64>,
    timeout: Option<Duration>,
}

impl LocalTransport {
    fn check_rank(&self, rank: i32) -> Result<()> {
        if rank < 0 || rank >= self.ctx.npes() {
            return Err(Error::Transport(format!(
                "rank {rank} out of range [0, {})",
                self.ctx.npes()
            )));
        }
        Ok(())
    }

    fn check_aborted(&self) -> Result<()> {
        match self.aborted.borrow().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn next_envelope(&self, src: i32) -> Result<Envelope> {
        match self.timeout {
            Some(limit) => self.inbox.recv_timeout(limit).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Transport(format!(
                    "PE {} timed out after {limit:?} waiting for PE {src}",
                    self.ctx.rank()
                )),
                RecvTimeoutError::Disconnected => {
                    Error::Transport("local world disconnected".into())
                }
            }),
            None => self
                .inbox
                .recv()
                .map_err(|_| Error::Transport("local world disconnected".into())),
        }
    }
}

impl Transport for LocalTransport {
    fn context(&self) -> ProcessContext {
        self.ctx
    }

    fn send(&self, dest: i32, tag: Tag, payload: Vec<u8>) -> Result<()> {
        self.check_aborted()?;
        self.check_rank(dest)?;
        trace!(src = self.ctx.rank(), dest, ?tag, bytes = payload.len(), "send");
        self.peers[dest as usize]
            .send(Envelope {
                src: self.ctx.rank(),
                tag,
                body: Body::Data(payload),
            })
            .map_err(|_| Error::Transport(format!("PE {dest} has left the local world")))
    }

    fn recv(&self, src: i32, tag: Tag) -> Result<Vec<u8>> {
        self.check_aborted()?;
        self.check_rank(src)?;

        {
            let mut parked = self.parked.borrow_mut();
            if let Some(pos) = parked.iter().position(|(s, t, _)| *s == src && *t == tag) {
                if let Some((_, _, bytes)) = parked.remove(pos) {
                    return Ok(bytes);
                }
            }
        }

        loop {
            let env = self.next_envelope(src)?;
            match env.body {
                Body::Abort(reason) => {
                    warn!(
                        pe = self.ctx.rank(),
                        origin = env.src,
                        %reason,
                        "job aborted by peer"
                    );
                    let err = Error::Aborted {
                        origin: env.src,
                        reason,
                    };
                    *self.aborted.borrow_mut() = Some(err.clone());
                    return Err(err);
                }
                Body::Data(bytes) if env.src == src && env.tag == tag => return Ok(bytes),
                Body::Data(bytes) => self.parked.borrow_mut().push_back((env.src, env.tag, bytes)),
            }
        }
    }

    fn barrier(&self) -> Result<()> {
        let epoch = self.barrier_epoch.get();
        self.barrier_epoch.set(epoch + 1);
        let rounds = schedule::dissemination(self.ctx.rank(), self.ctx.npes());
        for (round, step) in rounds.iter().enumerate() {
            let tag = Tag::new(BARRIER_CONTEXT, epoch, round as u32);
            self.send(step.to, tag, Vec::new())?;
            self.recv(step.from, tag)?;
        }
        Ok(())
    }

    fn abort(&self, reason: &str) {
        if self.aborted.borrow().is_some() {
            return;
        }
        let me = self.ctx.rank();
        error!(pe = me, %reason, "aborting local world");
        *self.aborted.borrow_mut() = Some(Error::Aborted {
            origin: me,
            reason: reason.to_string(),
        });
        for (dest, peer) in self.peers.iter().enumerate() {
            if dest as i32 == me {
                continue;
            }
            // Peers that already finished have dropped their inbox.
            let _ = peer.send(Envelope {
                src: me,
                tag: Tag::new(BARRIER_CONTEXT, u64::MAX, u32::MAX),
                body: Body::Abort(reason.to_string()),
            });
        }
    }
}

/// A simulated job of `npes` PEs living in the current process.
#[derive(Debug, Clone)]
pub struct LocalWorld {
    npes: i32,
    config: Config,
}

impl LocalWorld {
    /// A world of `npes` PEs with the default [`Config`].
    pub fn new(npes: i32) -> Result<Self> {
        if npes < 1 {
            return Err(Error::invalid(format!("npes must be >= 1, got {npes}")));
        }
        Ok(LocalWorld {
            npes,
            config: Config::default(),
        })
    }

    /// Replace the configuration handed to every PE.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Number of PEs.
    pub fn npes(&self) -> i32 {
        self.npes
    }

    /// The configuration every PE starts with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the connected endpoints, index = global rank.
    pub fn transports(&self) -> Vec<LocalTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.npes)
            .map(|_| crossbeam_channel::unbounded())
            .unzip();
        let peers: Arc<[Sender<Envelope>]> = senders.into();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                ctx: ProcessContext {
                    rank: rank as i32,
                    npes: self.npes,
                },
                peers: Arc::clone(&peers),
                inbox,
                parked: RefCell::new(VecDeque::new()),
                aborted: RefCell::new(None),
                barrier_epoch: Cell::new(0),
                timeout: self.config.recv_timeout,
            })
            .collect()
    }

    /// Run `f` on every PE, one thread each, and collect the results by rank.
    ///
    /// A PE whose closure returns an error or panics aborts the world, so its
    /// peers fail with [`Error::Aborted`] instead of blocking forever.
    pub fn run<F, R>(&self, f: F) -> Vec<Result<R>>
    where
        F: Fn(&mut Pe<LocalTransport>) -> Result<R> + Sync,
        R: Send,
    {
        let transports = self.transports();
        thread::scope(|s| {
            let handles: Vec<_> = transports
                .into_iter()
                .map(|transport| {
                    let f = &f;
                    let config = self.config.clone();
                    s.spawn(move || run_pe(transport, config, f))
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(Error::Internal(format!("PE {rank} thread panicked")))
                    })
                })
                .collect()
        })
    }
}

fn run_pe<F, R>(transport: LocalTransport, config: Config, f: &F) -> Result<R>
where
    F: Fn(&mut Pe<LocalTransport>) -> Result<R>,
{
    let rank = transport.ctx.rank();
    let mut pe = Pe::new(transport, config)?;
    match panic::catch_unwind(AssertUnwindSafe(|| f(&mut pe))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            if !err.is_relayed() {
                pe.abort(&err.to_string());
            }
            Err(err)
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            pe.abort(&format!("PE {rank} panicked: {msg}"));
            Err(Error::Internal(format!("PE {rank} panicked: {msg}")))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(round: u32) -> Tag {
        Tag::new(7, 0, round)
    }

    #[test]
    fn out_of_order_messages_are_parked() {
        let world = LocalWorld::new(2).unwrap();
        let mut eps = world.transports();
        let b = eps.pop().unwrap();
        let a = eps.pop().unwrap();

        a.send(1, tag(2), vec![2]).unwrap();
        a.send(1, tag(1), vec![1]).unwrap();
        a.send(1, tag(1), vec![11]).unwrap();

        assert_eq!(b.recv(0, tag(1)).unwrap(), vec![1]);
        assert_eq!(b.recv(0, tag(2)).unwrap(), vec![2]);
        assert_eq!(b.recv(0, tag(1)).unwrap(), vec![11]);
    }

    #[test]
    fn self_send() {
        let world = LocalWorld::new(1).unwrap();
        let ep = world.transports().pop().unwrap();
        ep.send(0, tag(0), vec![5, 6]).unwrap();
        assert_eq!(ep.recv(0, tag(0)).unwrap(), vec![5, 6]);
    }

    #[test]
    fn rejects_bad_ranks() {
        let world = LocalWorld::new(2).unwrap();
        let ep = world.transports().pop().unwrap();
        assert!(matches!(ep.send(2, tag(0), vec![]), Err(Error::Transport(_))));
        assert!(matches!(ep.recv(-1, tag(0)), Err(Error::Transport(_))));
        assert!(LocalWorld::new(0).is_err());
    }

    #[test]
    fn abort_wakes_receivers() {
        let world = LocalWorld::new(3).unwrap();
        let eps = world.transports();
        eps[2].abort("disk on fire");
        for ep in &eps[..2] {
            match ep.recv(1, tag(0)) {
                Err(Error::Aborted { origin, reason }) => {
                    assert_eq!(origin, 2);
                    assert_eq!(reason, "disk on fire");
                }
                other => panic!("expected abort, got {other:?}"),
            }
            // Sticky: later calls fail too.
            assert!(matches!(ep.send(0, tag(0), vec![]), Err(Error::Aborted { .. })));
        }
    }

    #[test]
    fn recv_timeout() {
        let config = Config::default().with_recv_timeout(Duration::from_millis(20));
        let world = LocalWorld::new(2).unwrap().with_config(config);
        let ep = world.transports().pop().unwrap();
        assert!(matches!(ep.recv(0, tag(0)), Err(Error::Transport(_))));
    }

    #[test]
    fn repeated_barriers() {
        let world = LocalWorld::new(5).unwrap();
        let results = world.run(|pe| {
            for _ in 0..10 {
                pe.barrier_all()?;
            }
            Ok(pe.my_pe())
        });
        let ranks: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn panicking_pe_aborts_the_rest() {
        let config = Config::default().with_recv_timeout(Duration::from_secs(10));
        let world = LocalWorld::new(3).unwrap().with_config(config);
        let results = world.run(|pe| {
            if pe.my_pe() == 1 {
                panic!("rank one gives up");
            }
            pe.barrier_all()
        });
        assert!(matches!(results[1], Err(Error::Internal(_))));
        for r in [0usize, 2] {
            assert!(
                matches!(results[r], Err(Error::Aborted { origin: 1, .. })),
                "PE {r}: {:?}",
                results[r]
            );
        }
    }
}
