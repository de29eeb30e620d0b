//! 2D cartesian split example - row and column teams.
//!
//! Uses `xrange = yrange = floor(log2(npes))` (1 for a single PE). PEs past
//! the `xrange * yrange` grid get `Team::NULL` for both axes.
//!
//! Run with: cargo run --example split_2d -- 4

use ferroteam::{Config, LocalWorld, Result, Team};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let npes: i32 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);
    let world = LocalWorld::new(npes)?.with_config(Config::from_env());

    let results = world.run(|pe| {
        let rank = pe.my_pe();
        let npes = pe.n_pes();

        let range = if npes == 1 { 1 } else { npes.ilog2() as i32 };
        let (xaxis, yaxis) = pe.split_2d(Team::WORLD, range, range)?;

        for (name, team) in [("xaxis_team", xaxis), ("yaxis_team", yaxis)] {
            if team != Team::NULL {
                let t_pe = pe.team_rank(team)?;
                let t_size = pe.team_size(team)?;
                println!("Global PE {rank} has team_pe of {t_pe} out of {t_size} in {name}");
            }
        }

        pe.barrier_all()?;
        Ok(())
    });
    results.into_iter().collect::<Result<Vec<()>>>()?;

    println!("\n2D split example passed on {npes} PEs");
    Ok(())
}
