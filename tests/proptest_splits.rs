//! Property-based tests for splits and reductions.
//!
//! Each case runs a whole simulated job, so the case counts stay small.

use ferroteam::{Config, LocalWorld, SyncBuffer, Team, WorkBuffer, COLOR_UNDEFINED};
use proptest::prelude::*;
use std::time::Duration;

fn world(npes: i32) -> LocalWorld {
    LocalWorld::new(npes)
        .unwrap()
        .with_config(Config::default().with_recv_timeout(Duration::from_secs(10)))
}

/// (color, key) per PE; colors in 0..4 plus the occasional opt-out.
fn color_keys() -> impl Strategy<Value = Vec<(i32, i32)>> {
    prop::collection::vec(
        (
            prop_oneof![4 => 0i32..4, 1 => Just(COLOR_UNDEFINED)],
            -3i32..3,
        ),
        1..10,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn color_split_matches_sorted_model(choices in color_keys()) {
        let npes = choices.len() as i32;
        let results = world(npes).run(|pe| {
            let (color, key) = choices[pe.my_pe() as usize];
            let team = pe.split_color(Team::WORLD, color, key)?;
            if team.is_null() {
                return Ok(None);
            }
            Ok(Some((pe.team_rank(team)?, pe.team_members(team)?.to_vec())))
        });

        for (r, outcome) in results.into_iter().enumerate() {
            let outcome = outcome.unwrap();
            let (color, _) = choices[r];
            if color == COLOR_UNDEFINED {
                prop_assert_eq!(outcome, None);
                continue;
            }
            let mut model: Vec<(i32, usize)> = choices
                .iter()
                .enumerate()
                .filter(|(_, (c, _))| *c == color)
                .map(|(p, (_, k))| (*k, p))
                .collect();
            model.sort();
            let members: Vec<i32> = model.iter().map(|&(_, p)| p as i32).collect();
            let rank = members.iter().position(|&p| p == r as i32).unwrap() as i32;
            prop_assert_eq!(outcome, Some((rank, members)));
        }
    }

    #[test]
    fn strided_split_matches_filter(
        npes in 1i32..12,
        start in 0i32..4,
        stride in 1i32..4,
        size in 1i32..6,
    ) {
        prop_assume!(start + (size - 1) * stride < npes);
        let results = world(npes).run(|pe| {
            let team = pe.split_strided(Team::WORLD, start, stride, size)?;
            Ok(pe.team_rank(team).ok())
        });
        for (r, rank) in results.into_iter().enumerate() {
            let r = r as i32;
            let expected = (r >= start && (r - start) % stride == 0 && (r - start) / stride < size)
                .then(|| (r - start) / stride);
            prop_assert_eq!(rank.unwrap(), expected);
        }
    }

    #[test]
    fn or_reduction_matches_fold(
        values in prop::collection::vec(prop::collection::vec(any::<u32>(), 5), 1..9),
    ) {
        let npes = values.len() as i32;
        let results = world(npes).run(|pe| {
            let source = &values[pe.my_pe() as usize];
            let mut dest = vec![0u32; 5];
            let mut work = WorkBuffer::for_nreduce(5);
            let sync = SyncBuffer::new();
            pe.or_to_all(Team::WORLD, &mut dest, source, &mut work, &sync)?;
            Ok(dest)
        });
        let expected: Vec<u32> = (0..5)
            .map(|i| values.iter().fold(0, |acc, v| acc | v[i]))
            .collect();
        for dest in results {
            prop_assert_eq!(dest.unwrap(), expected.clone());
        }
    }
}
