//! Team handles and the per-PE team registry.

use crate::error::{Error, Result};
use crate::transport::{Tag, Transport};
use crate::Pe;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Context id of [`Team::WORLD`].
pub(crate) const WORLD_CONTEXT: u64 = 1;

/// Opaque slot reference inside the per-PE team registry.
///
/// The generation changes every time a slot is reused, so a handle kept after
/// [`Pe::team_destroy`] is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TeamId {
    slot: u32,
    generation: u32,
}

/// A team handle.
///
/// Handles are only meaningful on the PE that obtained them. Compare against
/// [`Team::NULL`] before use: a PE left out of a split gets `NULL` back.
///
/// # Example
///
/// ```
/// use ferroteam::{LocalWorld, Team};
///
/// let world = LocalWorld::new(4).unwrap();
/// let results = world.run(|pe| {
///     let odd = pe.split_strided(Team::WORLD, 1, 2, 2)?;
///     Ok(odd != Team::NULL)
/// });
/// let member: Vec<bool> = results.into_iter().map(|r| r.unwrap()).collect();
/// assert_eq!(member, vec![false, true, false, true]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Team {
    /// Not a member of any team.
    Null,
    /// A live (or once-live) team on this PE.
    Valid(TeamId),
}

impl Team {
    /// The NULL team.
    pub const NULL: Team = Team::Null;

    /// Every PE of the job, ranked by global rank.
    pub const WORLD: Team = Team::Valid(TeamId {
        slot: 0,
        generation: 0,
    });

    /// Whether this is [`Team::NULL`].
    pub fn is_null(&self) -> bool {
        matches!(self, Team::Null)
    }
}

impl Default for Team {
    fn default() -> Self {
        Team::NULL
    }
}

/// Mix a parent context, the parent's collective sequence number and a
/// subgroup discriminator into the context id of a child team.
///
/// Every member of the child computes the same inputs, hence the same id.
pub(crate) fn derive_context(parent: u64, seq: u64, subgroup: u64) -> u64 {
    let mut h = parent;
    for word in [seq, subgroup] {
        h = splitmix64(h ^ word.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    }
    if h <= WORLD_CONTEXT {
        h + 2
    } else {
        h
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Bookkeeping for one team this PE belongs to.
#[derive(Debug)]
pub(crate) struct TeamEntry {
    members: Rc<[i32]>,
    index: HashMap<i32, i32>,
    my_rank: i32,
    parent: Team,
    context: u64,
    seq: u64,
}

impl TeamEntry {
    pub(crate) fn size(&self) -> i32 {
        self.members.len() as i32
    }
}

/// Snapshot of a team taken at the start of a collective.
#[derive(Debug, Clone)]
pub(crate) struct TeamView {
    pub(crate) members: Rc<[i32]>,
    pub(crate) my_rank: i32,
    pub(crate) context: u64,
    pub(crate) seq: u64,
}

impl TeamView {
    pub(crate) fn size(&self) -> i32 {
        self.members.len() as i32
    }

    /// Global rank of team-local rank `local`.
    pub(crate) fn global(&self, local: i32) -> i32 {
        self.members[local as usize]
    }

    pub(crate) fn tag(&self, round: u32) -> Tag {
        Tag::new(self.context, self.seq, round)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<TeamEntry>,
}

/// The teams the calling PE is a member of.
#[derive(Debug)]
pub(crate) struct TeamRegistry {
    slots: Vec<Slot>,
    live: usize,
    capacity: usize,
}

impl TeamRegistry {
    /// An empty registry holding at most `capacity` live teams.
    pub(crate) fn new(capacity: usize) -> Self {
        TeamRegistry {
            slots: Vec::new(),
            live: 0,
            capacity,
        }
    }

    /// Register a team given its members as global ranks, in local-rank order.
    pub(crate) fn register(
        &mut self,
        members: Vec<i32>,
        my_rank: i32,
        parent: Team,
        context: u64,
    ) -> Result<Team> {
        if my_rank < 0 || my_rank as usize >= members.len() {
            return Err(Error::Internal(format!(
                "local rank {my_rank} outside team of {}",
                members.len()
            )));
        }
        let mut index = HashMap::with_capacity(members.len());
        for (local, &global) in members.iter().enumerate() {
            if index.insert(global, local as i32).is_some() {
                return Err(Error::Internal(format!(
                    "PE {global} listed twice in team membership"
                )));
            }
        }
        if self.live >= self.capacity {
            return Err(Error::ResourceExhausted {
                capacity: self.capacity,
            });
        }

        let entry = TeamEntry {
            members: members.into(),
            index,
            my_rank,
            parent,
            context,
            seq: 0,
        };
        let slot = match self.slots.iter().position(|s| s.entry.is_none()) {
            Some(free) => free,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        self.slots[slot].entry = Some(entry);
        self.live += 1;

        let team = Team::Valid(TeamId {
            slot: slot as u32,
            generation: self.slots[slot].generation,
        });
        debug!(?team, context, my_rank, "team registered");
        Ok(team)
    }

    pub(crate) fn get(&self, team: Team) -> Result<&TeamEntry> {
        let id = match team {
            Team::Null => return Err(Error::NotMember),
            Team::Valid(id) => id,
        };
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_ref())
            .ok_or(Error::InvalidTeam)
    }

    fn get_mut(&mut self, team: Team) -> Result<&mut TeamEntry> {
        let id = match team {
            Team::Null => return Err(Error::NotMember),
            Team::Valid(id) => id,
        };
        self.slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_mut())
            .ok_or(Error::InvalidTeam)
    }

    /// Claim the next collective sequence number of `team`.
    ///
    /// Members issue collectives on a team in the same order, so the number
    /// agrees across them.
    pub(crate) fn begin_collective(&mut self, team: Team) -> Result<TeamView> {
        let entry = self.get_mut(team)?;
        let seq = entry.seq;
        entry.seq += 1;
        Ok(TeamView {
            members: Rc::clone(&entry.members),
            my_rank: entry.my_rank,
            context: entry.context,
            seq,
        })
    }

    /// Remove `team` and every descendant. Returns how many teams went away.
    pub(crate) fn destroy(&mut self, team: Team) -> Result<usize> {
        if team.is_null() {
            return Ok(0);
        }
        if team == Team::WORLD {
            return Err(Error::invalid("the world team cannot be destroyed"));
        }
        self.get(team)?;

        let children: Vec<Team> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| {
                let entry = s.entry.as_ref()?;
                (entry.parent == team).then_some(Team::Valid(TeamId {
                    slot: slot as u32,
                    generation: s.generation,
                }))
            })
            .collect();
        let mut removed = 0;
        for child in children {
            removed += self.destroy(child)?;
        }

        if let Team::Valid(id) = team {
            let slot = &mut self.slots[id.slot as usize];
            slot.entry = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.live -= 1;
            removed += 1;
        }
        Ok(removed)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live
    }
}

// ========================================================================
// Team queries
// ========================================================================

impl<T: Transport> Pe<T> {
    /// Number of PEs in `team`.
    ///
    /// # Errors
    ///
    /// [`Error::NotMember`] for [`Team::NULL`], [`Error::InvalidTeam`] for a
    /// destroyed handle.
    pub fn team_size(&self, team: Team) -> Result<i32> {
        Ok(self.registry.get(team)?.size())
    }

    /// Rank of the calling PE within `team`.
    pub fn team_rank(&self, team: Team) -> Result<i32> {
        Ok(self.registry.get(team)?.my_rank)
    }

    /// Global ranks of the members of `team`, in team-rank order.
    pub fn team_members(&self, team: Team) -> Result<&[i32]> {
        Ok(&*self.registry.get(team)?.members)
    }

    /// The team `team` was split from; [`Team::NULL`] for the world team.
    pub fn team_parent(&self, team: Team) -> Result<Team> {
        Ok(self.registry.get(team)?.parent)
    }

    /// Map rank `rank` of `src_team` to its rank in `dest_team`.
    ///
    /// Returns `Ok(None)` when that PE is not a member of `dest_team`.
    pub fn team_translate(&self, src_team: Team, rank: i32, dest_team: Team) -> Result<Option<i32>> {
        let src = self.registry.get(src_team)?;
        let dest = self.registry.get(dest_team)?;
        if rank < 0 || rank >= src.size() {
            return Err(Error::invalid(format!(
                "rank {rank} out of range [0, {})",
                src.size()
            )));
        }
        let global = src.members[rank as usize];
        Ok(dest.index.get(&global).copied())
    }

    /// Release `team` and any team split from it on this PE.
    ///
    /// Destroying [`Team::NULL`] does nothing. Like the split that created it,
    /// destruction should be performed by every member.
    pub fn team_destroy(&mut self, team: Team) -> Result<()> {
        let removed = self.registry.destroy(team)?;
        debug!(pe = self.my_pe(), ?team, removed, "team destroyed");
        Ok(())
    }

    /// Number of live teams on this PE, [`Team::WORLD`] included.
    pub fn live_teams(&self) -> usize {
        self.registry.live_count()
    }
}
