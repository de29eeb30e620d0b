//! Small collectives the split engine is built on, and the team barrier.

use crate::datatype::{decode_into, encode_slice};
use crate::error::{Error, Result};
use crate::schedule;
use crate::team::{Team, TeamView};
use crate::transport::Transport;
use crate::Pe;
use tracing::debug;

impl<T: Transport> Pe<T> {
    /// Ring all-gather of a fixed number of words per member.
    ///
    /// Returns one entry per team rank, in team-rank order.
    pub(crate) fn allgather_words(&self, view: &TeamView, words: &[i64]) -> Result<Vec<Vec<i64>>> {
        let size = view.size() as usize;
        let mut blocks: Vec<Option<Vec<u8>>> = vec![None; size];
        blocks[view.my_rank as usize] = Some(encode_slice(&[], words));

        for (round, step) in schedule::ring_allgather(view.my_rank, view.size())
            .iter()
            .enumerate()
        {
            let tag = view.tag(round as u32);
            let outgoing = blocks[step.send_block as usize].clone().ok_or_else(|| {
                Error::Internal(format!("all-gather block {} missing", step.send_block))
            })?;
            self.transport.send(view.global(step.send_to), tag, outgoing)?;
            let incoming = self.transport.recv(view.global(step.recv_from), tag)?;
            blocks[step.recv_block as usize] = Some(incoming);
        }

        blocks
            .into_iter()
            .enumerate()
            .map(|(rank, block)| {
                let bytes = block
                    .ok_or_else(|| Error::Internal(format!("all-gather block {rank} missing")))?;
                let mut out = vec![0i64; words.len()];
                if !decode_into(&bytes, &mut out) {
                    return Err(Error::invalid(format!(
                        "PE {} contributed {} bytes to an all-gather of {} words",
                        view.global(rank as i32),
                        bytes.len(),
                        words.len()
                    )));
                }
                Ok(out)
            })
            .collect()
    }

    /// Fail unless every member passed the same `words`.
    pub(crate) fn agree(&self, view: &TeamView, what: &str, words: &[i64]) -> Result<()> {
        let all = self.allgather_words(view, words)?;
        for (rank, theirs) in all.iter().enumerate() {
            if theirs.as_slice() != words {
                return Err(Error::invalid(format!(
                    "{what} differ across PEs: PE {} passed {theirs:?}, PE {} passed {words:?}",
                    view.global(rank as i32),
                    self.my_pe()
                )));
            }
        }
        Ok(())
    }

    /// Barrier over the members of `team` only.
    ///
    /// Every member must call it; no member returns before all have entered.
    pub fn team_sync(&mut self, team: Team) -> Result<()> {
        let result = self.team_sync_inner(team);
        result.map_err(|e| self.fail(e))
    }

    fn team_sync_inner(&mut self, team: Team) -> Result<()> {
        let view = self.registry.begin_collective(team)?;
        debug!(pe = self.my_pe(), ?team, size = view.size(), "team sync");
        for (round, step) in schedule::dissemination(view.my_rank, view.size())
            .iter()
            .enumerate()
        {
            let tag = view.tag(round as u32);
            self.transport.send(view.global(step.to), tag, Vec::new())?;
            self.transport.recv(view.global(step.from), tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, Error, LocalWorld, Team};
    use std::time::Duration;

    fn world(npes: i32) -> LocalWorld {
        LocalWorld::new(npes)
            .unwrap()
            .with_config(Config::default().with_recv_timeout(Duration::from_secs(10)))
    }

    #[test]
    fn allgather_collects_in_rank_order() {
        let results = world(5).run(|pe| {
            let view = pe.registry.begin_collective(Team::WORLD)?;
            let me = i64::from(pe.my_pe());
            pe.allgather_words(&view, &[me, me * 10])
        });
        let expected: Vec<Vec<i64>> = (0..5).map(|r| vec![r, r * 10]).collect();
        for r in results {
            assert_eq!(r.unwrap(), expected);
        }
    }

    #[test]
    fn agree_detects_mismatch() {
        let results = world(4).run(|pe| {
            let view = pe.registry.begin_collective(Team::WORLD)?;
            let value = if pe.my_pe() == 2 { 9 } else { 1 };
            pe.agree(&view, "test parameters", &[value])
        });
        // Whoever finishes the exchange first aborts the rest, so a PE may see
        // the abort before its own comparison.
        for r in &results {
            assert!(
                matches!(r, Err(Error::InvalidArgument(_)) | Err(Error::Aborted { .. })),
                "{r:?}"
            );
        }
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::InvalidArgument(_)))));
    }

    #[test]
    fn team_sync_on_world_and_null() {
        let results = world(6).run(|pe| {
            for _ in 0..5 {
                pe.team_sync(Team::WORLD)?;
            }
            Ok(())
        });
        assert!(results.iter().all(|r| r.is_ok()));

        let results = world(1).run(|pe| pe.team_sync(Team::NULL));
        assert!(matches!(results[0], Err(Error::NotMember)));
    }
}
