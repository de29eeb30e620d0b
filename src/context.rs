//! Per-process facts: global rank and number of PEs.
//!
//! A [`ProcessContext`] is normally handed out by the transport. When a
//! program is started by a process launcher, [`ProcessContext::from_env`] reads
//! the launcher's environment instead.
//!
//! # Environment Variables
//!
//! Checked in order; the first complete pair wins.
//!
//! | Launcher | Rank variable | Size variable |
//! |----------|---------------|---------------|
//! | PMI (Hydra, MPICH) | `PMI_RANK` | `PMI_SIZE` |
//! | Open MPI | `OMPI_COMM_WORLD_RANK` | `OMPI_COMM_WORLD_SIZE` |
//! | SLURM `srun` | `SLURM_PROCID` | `SLURM_NTASKS` |

use crate::error::{Error, Result};
use std::env;

const LAUNCHER_VARS: [(&str, &str); 3] = [
    ("PMI_RANK", "PMI_SIZE"),
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("SLURM_PROCID", "SLURM_NTASKS"),
];

/// Read-only facts about the calling PE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessContext {
    pub(crate) rank: i32,
    pub(crate) npes: i32,
}

impl ProcessContext {
    /// Build a context, checking `0 <= rank < npes`.
    pub fn new(rank: i32, npes: i32) -> Result<Self> {
        if npes < 1 {
            return Err(Error::invalid(format!("npes must be >= 1, got {npes}")));
        }
        if rank < 0 || rank >= npes {
            return Err(Error::invalid(format!(
                "rank {rank} out of range [0, {npes})"
            )));
        }
        Ok(ProcessContext { rank, npes })
    }

    /// Discover rank and size from the process launcher's environment.
    ///
    /// Returns `None` when no known launcher variables are set.
    pub fn from_env() -> Option<Result<Self>> {
        LAUNCHER_VARS.iter().find_map(|(rank_var, size_var)| {
            let rank = parse_var(rank_var)?;
            let npes = parse_var(size_var)?;
            Some(Self::new(rank, npes))
        })
    }

    /// Global rank of the calling PE.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Total number of PEs in the job.
    pub fn npes(&self) -> i32 {
        self.npes
    }
}

fn parse_var(name: &str) -> Option<i32> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range() {
        assert!(ProcessContext::new(0, 1).is_ok());
        assert!(ProcessContext::new(3, 4).is_ok());
        assert!(matches!(
            ProcessContext::new(4, 4),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ProcessContext::new(-1, 4),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ProcessContext::new(0, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    /// Tests that mutate environment variables are combined into a single test
    /// to avoid data races when tests run in parallel.
    #[test]
    fn launcher_env_parsing() {
        let all = [
            "PMI_RANK",
            "PMI_SIZE",
            "OMPI_COMM_WORLD_RANK",
            "OMPI_COMM_WORLD_SIZE",
            "SLURM_PROCID",
            "SLURM_NTASKS",
        ];
        let saved: Vec<_> = all.iter().map(|k| (k, env::var(k).ok())).collect();
        for k in all {
            env::remove_var(k);
        }

        assert!(ProcessContext::from_env().is_none());

        // --- SLURM alone ---
        env::set_var("SLURM_PROCID", "2");
        env::set_var("SLURM_NTASKS", "8");
        assert_eq!(
            ProcessContext::from_env(),
            Some(Ok(ProcessContext { rank: 2, npes: 8 }))
        );

        // --- PMI takes priority over SLURM ---
        env::set_var("PMI_RANK", "5");
        env::set_var("PMI_SIZE", "6");
        assert_eq!(
            ProcessContext::from_env(),
            Some(Ok(ProcessContext { rank: 5, npes: 6 }))
        );

        // --- incomplete pair falls through ---
        env::remove_var("PMI_SIZE");
        assert_eq!(
            ProcessContext::from_env(),
            Some(Ok(ProcessContext { rank: 2, npes: 8 }))
        );

        // --- inconsistent values are rejected ---
        env::set_var("SLURM_PROCID", "9");
        assert!(matches!(
            ProcessContext::from_env(),
            Some(Err(Error::InvalidArgument(_)))
        ));

        for (k, v) in saved {
            match v {
                Some(v) => env::set_var(k, v),
                None => env::remove_var(k),
            }
        }
    }
}
