//! Team splitting: strided, color/key and cartesian partitions of a parent team.
//!
//! The membership rules are pure functions of the parent size and the split
//! parameters. The color/key split needs every member's `(color, key)` and
//! gathers them first; the other splits only communicate to cross-check their
//! shared parameters when [`Config::check_args`](crate::Config::check_args) is on.
//!
//! All splits are collective over the parent team. A PE left out of the
//! resulting team gets [`Team::NULL`].

use crate::error::{Error, Result};
use crate::team::{derive_context, Team};
use crate::transport::Transport;
use crate::Pe;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Color that opts a PE out of [`Pe::split_color`].
pub const COLOR_UNDEFINED: i32 = -1;

const AXIS_NAMES: [&str; 3] = ["xrange", "yrange", "zrange"];

/// Subgroup discriminator: axis in the top 16 bits, index below.
fn subgroup(axis: u64, index: u64) -> u64 {
    (axis << 48) | (index & ((1 << 48) - 1))
}

// ========================================================================
// Strided
// ========================================================================

pub(crate) fn check_strided(parent_size: i32, start: i32, stride: i32, size: i32) -> Result<()> {
    if start < 0 {
        return Err(Error::invalid(format!("PE_start must be >= 0, got {start}")));
    }
    if stride < 1 {
        return Err(Error::invalid(format!("PE_stride must be >= 1, got {stride}")));
    }
    if size < 1 {
        return Err(Error::invalid(format!("PE_size must be >= 1, got {size}")));
    }
    let last = i64::from(start) + i64::from(stride) * (i64::from(size) - 1);
    if last >= i64::from(parent_size) {
        return Err(Error::invalid(format!(
            "triplet ({start}, {stride}, {size}) reaches parent rank {last}, parent has {parent_size} PEs"
        )));
    }
    Ok(())
}

/// New rank of parent rank `r`, or `None` if the triplet skips it.
pub(crate) fn strided_rank(r: i32, start: i32, stride: i32, size: i32) -> Option<i32> {
    if r < start {
        return None;
    }
    let offset = r - start;
    if offset % stride != 0 {
        return None;
    }
    let rank = offset / stride;
    (rank < size).then_some(rank)
}

pub(crate) fn strided_members(start: i32, stride: i32, size: i32) -> Vec<i32> {
    (0..size).map(|k| start + k * stride).collect()
}

// ========================================================================
// Color / key
// ========================================================================

/// One member's contribution to a color/key split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColorEntry {
    pub(crate) parent_rank: i32,
    pub(crate) color: i32,
    pub(crate) key: i32,
}

/// Group parent ranks by color, each group ordered by `(key, parent_rank)`.
///
/// Entries with [`COLOR_UNDEFINED`] belong to no group.
pub(crate) fn color_partition(entries: &[ColorEntry]) -> BTreeMap<i32, Vec<i32>> {
    let mut groups: BTreeMap<i32, Vec<ColorEntry>> = BTreeMap::new();
    for e in entries.iter().filter(|e| e.color != COLOR_UNDEFINED) {
        groups.entry(e.color).or_default().push(*e);
    }
    groups
        .into_iter()
        .map(|(color, mut group)| {
            group.sort_by_key(|e| (e.key, e.parent_rank));
            (color, group.iter().map(|e| e.parent_rank).collect())
        })
        .collect()
}

// ========================================================================
// Cartesian
// ========================================================================

/// Row-major cartesian space over the first `volume` parent ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Grid {
    dims: Vec<i32>,
    volume: i32,
}

impl Grid {
    pub(crate) fn new(dims: &[i32], parent_size: i32) -> Result<Self> {
        for (axis, &d) in dims.iter().enumerate() {
            if d < 0 {
                let name = AXIS_NAMES.get(axis).copied().unwrap_or("range");
                return Err(Error::invalid(format!("{name} must be >= 0, got {d}")));
            }
        }
        let volume = dims
            .iter()
            .try_fold(1i64, |acc, &d| acc.checked_mul(i64::from(d)))
            .filter(|&v| v <= i64::from(parent_size))
            .ok_or_else(|| {
                Error::invalid(format!(
                    "cartesian space {dims:?} does not fit in a parent team of {parent_size} PEs"
                ))
            })?;
        Ok(Grid {
            dims: dims.to_vec(),
            volume: volume as i32,
        })
    }

    /// Coordinates of parent rank `r`, `None` outside the space.
    pub(crate) fn coords(&self, r: i32) -> Option<Vec<i32>> {
        if r < 0 || r >= self.volume {
            return None;
        }
        let mut rest = r;
        Some(
            self.dims
                .iter()
                .map(|&d| {
                    let c = rest % d;
                    rest /= d;
                    c
                })
                .collect(),
        )
    }

    pub(crate) fn rank_of(&self, coords: &[i32]) -> i32 {
        coords
            .iter()
            .zip(&self.dims)
            .rev()
            .fold(0, |acc, (&c, &d)| acc * d + c)
    }

    /// Parent ranks sharing every coordinate but `axis`, ordered along `axis`.
    pub(crate) fn axis_line(&self, coords: &[i32], axis: usize) -> Vec<i32> {
        let mut point = coords.to_vec();
        (0..self.dims[axis])
            .map(|v| {
                point[axis] = v;
                self.rank_of(&point)
            })
            .collect()
    }

    /// Linear index of the line through `coords` along `axis`.
    pub(crate) fn line_index(&self, coords: &[i32], axis: usize) -> u64 {
        coords
            .iter()
            .zip(&self.dims)
            .enumerate()
            .filter(|(a, _)| *a != axis)
            .rev()
            .fold(0u64, |acc, (_, (&c, &d))| acc * d as u64 + c as u64)
    }
}

// ========================================================================
// Split operations
// ========================================================================

impl<T: Transport> Pe<T> {
    /// Split `parent` by the triplet `(start, stride, size)`.
    ///
    /// Parent rank `r` joins iff `r >= start`, `(r - start) % stride == 0` and
    /// `(r - start) / stride < size`; its new rank is `(r - start) / stride`.
    /// The triplet must be the same on every member of `parent`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a negative start, a stride below 1, a size
    /// below 1, or a triplet reaching past the parent team. Fatal to the job.
    pub fn split_strided(&mut self, parent: Team, start: i32, stride: i32, size: i32) -> Result<Team> {
        let result = self.split_strided_inner(parent, start, stride, size);
        result.map_err(|e| self.fail(e))
    }

    fn split_strided_inner(&mut self, parent: Team, start: i32, stride: i32, size: i32) -> Result<Team> {
        let view = self.registry.begin_collective(parent)?;
        if self.config.check_args {
            let triplet = [start, stride, size].map(i64::from);
            self.agree(&view, "strided split triplets", &triplet)?;
        }
        check_strided(view.size(), start, stride, size)?;

        let Some(my_rank) = strided_rank(view.my_rank, start, stride, size) else {
            debug!(pe = self.my_pe(), start, stride, size, "not selected by strided split");
            return Ok(Team::NULL);
        };
        let members = strided_members(start, stride, size)
            .into_iter()
            .map(|r| view.global(r))
            .collect();
        let context = derive_context(view.context, view.seq, subgroup(0, 0));
        let team = self.registry.register(members, my_rank, parent, context)?;
        debug!(pe = self.my_pe(), ?team, my_rank, size, "strided split");
        Ok(team)
    }

    /// Split `parent` into one team per distinct `color`.
    ///
    /// Within a team, PEs are ranked by ascending `key`, ties broken by parent
    /// rank. `color` and `key` may differ per PE; [`COLOR_UNDEFINED`] opts out
    /// and yields [`Team::NULL`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if any member supplied a negative color other
    /// than [`COLOR_UNDEFINED`]. Fatal to the job.
    pub fn split_color(&mut self, parent: Team, color: i32, key: i32) -> Result<Team> {
        let result = self.split_color_inner(parent, color, key);
        result.map_err(|e| self.fail(e))
    }

    fn split_color_inner(&mut self, parent: Team, color: i32, key: i32) -> Result<Team> {
        let view = self.registry.begin_collective(parent)?;
        let gathered = self.allgather_words(&view, &[i64::from(color), i64::from(key)])?;
        let entries: Vec<ColorEntry> = gathered
            .iter()
            .enumerate()
            .map(|(rank, words)| ColorEntry {
                parent_rank: rank as i32,
                color: words[0] as i32,
                key: words[1] as i32,
            })
            .collect();
        if let Some(bad) = entries
            .iter()
            .find(|e| e.color < 0 && e.color != COLOR_UNDEFINED)
        {
            return Err(Error::invalid(format!(
                "PE {} supplied color {}, colors must be >= 0 or COLOR_UNDEFINED",
                view.global(bad.parent_rank),
                bad.color
            )));
        }

        let groups = color_partition(&entries);
        debug!(pe = self.my_pe(), color, key, teams = groups.len(), "color split");
        if color == COLOR_UNDEFINED {
            return Ok(Team::NULL);
        }

        let group = groups
            .get(&color)
            .ok_or_else(|| Error::Internal(format!("color {color} missing from partition")))?;
        let my_rank = group
            .iter()
            .position(|&r| r == view.my_rank)
            .ok_or_else(|| Error::Internal("calling PE missing from its color group".into()))?;
        let members = group.iter().map(|&r| view.global(r)).collect();
        let context = derive_context(view.context, view.seq, subgroup(0, color as u64));
        self.registry
            .register(members, my_rank as i32, parent, context)
    }

    /// Split `parent` along a 2D cartesian space of `xrange * yrange` PEs.
    ///
    /// Parent rank `r < xrange * yrange` sits at `(r % xrange, r / xrange)`.
    /// The x-axis team holds the PEs of the same row ranked by x, the y-axis
    /// team the PEs of the same column ranked by y. Ranks beyond the space get
    /// [`Team::NULL`] twice.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for negative ranges or a space larger than
    /// the parent team. Fatal to the job.
    pub fn split_2d(&mut self, parent: Team, xrange: i32, yrange: i32) -> Result<(Team, Team)> {
        let teams = self.split_cartesian(parent, &[xrange, yrange])?;
        Ok((teams[0], teams[1]))
    }

    /// Split `parent` along a 3D cartesian space of `xrange * yrange * zrange` PEs.
    ///
    /// Parent rank `r = x + y * xrange + z * xrange * yrange`. Each axis team
    /// holds the PEs agreeing on the other two coordinates, ranked by their
    /// own. Ranks beyond the space get [`Team::NULL`] three times.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for negative ranges or a space larger than
    /// the parent team, [`Error::ResourceExhausted`] if the registry cannot
    /// hold all three axis teams. Fatal to the job.
    pub fn split_3d(
        &mut self,
        parent: Team,
        xrange: i32,
        yrange: i32,
        zrange: i32,
    ) -> Result<(Team, Team, Team)> {
        let teams = self.split_cartesian(parent, &[xrange, yrange, zrange])?;
        Ok((teams[0], teams[1], teams[2]))
    }

    fn split_cartesian(&mut self, parent: Team, dims: &[i32]) -> Result<Vec<Team>> {
        let result = self.split_cartesian_inner(parent, dims);
        result.map_err(|e| self.fail(e))
    }

    fn split_cartesian_inner(&mut self, parent: Team, dims: &[i32]) -> Result<Vec<Team>> {
        let view = self.registry.begin_collective(parent)?;
        if self.config.check_args {
            let words: Vec<i64> = dims.iter().map(|&d| i64::from(d)).collect();
            self.agree(&view, "cartesian ranges", &words)?;
        }
        let grid = Grid::new(dims, view.size())?;

        let Some(coords) = grid.coords(view.my_rank) else {
            debug!(pe = self.my_pe(), ?dims, "outside cartesian space");
            return Ok(vec![Team::NULL; dims.len()]);
        };

        let mut teams = Vec::with_capacity(dims.len());
        for axis in 0..dims.len() {
            let members = grid
                .axis_line(&coords, axis)
                .into_iter()
                .map(|r| view.global(r))
                .collect();
            let line = subgroup(axis as u64 + 1, grid.line_index(&coords, axis));
            let context = derive_context(view.context, view.seq, line);
            match self.registry.register(members, coords[axis], parent, context) {
                Ok(team) => teams.push(team),
                Err(err) => {
                    for team in teams {
                        if let Err(cleanup) = self.registry.destroy(team) {
                            warn!(pe = self.my_pe(), ?team, %cleanup, "axis rollback failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        debug!(pe = self.my_pe(), ?dims, ?coords, "cartesian split");
        Ok(teams)
    }
}
