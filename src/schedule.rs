//! Exchange schedules for the team collectives.
//!
//! Each function here is pure: given a team-local rank and the team size it
//! returns the ordered list of (peer, action) pairs that rank performs. The
//! collectives in [`reduce`](crate::Pe::reduce_to_all) and
//! [`team_sync`](crate::Pe::team_sync) just walk these lists, so the
//! communication pattern can be checked without any runtime.

/// One action of a recursive-doubling reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Hand the local contribution to a partner inside the power-of-two core.
    FoldSend(i32),
    /// Absorb the contribution of a rank outside the core.
    FoldRecv(i32),
    /// Swap partial results with a partner and combine.
    Exchange(i32),
    /// Return the final result to the rank that folded in.
    UnfoldSend(i32),
    /// Receive the final result from the core.
    UnfoldRecv(i32),
}

impl Action {
    /// Team-local rank of the peer.
    pub fn peer(self) -> i32 {
        match self {
            Action::FoldSend(p)
            | Action::FoldRecv(p)
            | Action::Exchange(p)
            | Action::UnfoldSend(p)
            | Action::UnfoldRecv(p) => p,
        }
    }
}

/// An action plus the round number both ends tag its message with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Round 0 is the fold, rounds `1..=log2(p)` the exchanges, the last round the unfold.
    pub round: u32,
    /// What to do in this round.
    pub action: Action,
}

/// Largest power of two not above `size` (`size >= 1`).
fn core_size(size: i32) -> i32 {
    let mut p = 1;
    while p * 2 <= size {
        p *= 2;
    }
    p
}

/// Recursive doubling with fold/unfold for sizes that are not a power of two.
///
/// With `p` the largest power of two not above `size`, ranks `>= p` fold into
/// rank `r - p`, the first `p` ranks run `log2(p)` pairwise exchanges, and the
/// folded ranks get the result back at the end.
pub fn recursive_doubling(rank: i32, size: i32) -> Vec<Step> {
    if size <= 1 || rank < 0 || rank >= size {
        return Vec::new();
    }
    let p = core_size(size);
    let log_p = p.trailing_zeros();
    let unfold_round = log_p + 1;

    if rank >= p {
        return vec![
            Step {
                round: 0,
                action: Action::FoldSend(rank - p),
            },
            Step {
                round: unfold_round,
                action: Action::UnfoldRecv(rank - p),
            },
        ];
    }

    let folded = rank + p < size;
    let mut steps = Vec::with_capacity(log_p as usize + 2);
    if folded {
        steps.push(Step {
            round: 0,
            action: Action::FoldRecv(rank + p),
        });
    }
    for bit in 0..log_p {
        steps.push(Step {
            round: bit + 1,
            action: Action::Exchange(rank ^ (1 << bit)),
        });
    }
    if folded {
        steps.push(Step {
            round: unfold_round,
            action: Action::UnfoldSend(rank + p),
        });
    }
    steps
}

/// One round of a ring all-gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStep {
    /// Right neighbour.
    pub send_to: i32,
    /// Left neighbour.
    pub recv_from: i32,
    /// Index of the block forwarded this round.
    pub send_block: i32,
    /// Index of the block that arrives this round.
    pub recv_block: i32,
}

/// Ring all-gather: `size - 1` rounds, each forwarding the block received in
/// the previous round to the right neighbour.
pub fn ring_allgather(rank: i32, size: i32) -> Vec<RingStep> {
    if size <= 1 || rank < 0 || rank >= size {
        return Vec::new();
    }
    (0..size - 1)
        .map(|k| RingStep {
            send_to: (rank + 1) % size,
            recv_from: (rank - 1 + size) % size,
            send_block: (rank - k + size) % size,
            recv_block: (rank - k - 1 + 2 * size) % size,
        })
        .collect()
}

/// One round of a dissemination barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRound {
    /// Rank signalled this round.
    pub to: i32,
    /// Rank waited on this round.
    pub from: i32,
}

/// Dissemination barrier: `ceil(log2(size))` rounds at distance 1, 2, 4, ...
pub fn dissemination(rank: i32, size: i32) -> Vec<SyncRound> {
    if size <= 1 || rank < 0 || rank >= size {
        return Vec::new();
    }
    let mut rounds = Vec::new();
    let mut dist = 1;
    while dist < size {
        rounds.push(SyncRound {
            to: (rank + dist) % size,
            from: (rank - dist + size) % size,
        });
        dist *= 2;
    }
    rounds
}
