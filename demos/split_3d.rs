//! 3D cartesian split example - one team per axis.
//!
//! With more than 4 PEs, `xrange = yrange = floor(log2(npes)) - 1`, otherwise
//! 1; `zrange` takes whatever is left: `npes / (xrange * yrange)`.
//!
//! Run with: cargo run --example split_3d -- 12

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
        .unwrap_or(12);
    let world = LocalWorld::new(npes)?.with_config(Config::from_env());

    let results = world.run(|pe| {
        let rank = pe.my_pe();
        let npes = pe.n_pes();

        let range = if npes > 4 { npes.ilog2() as i32 - 1 } else { 1 };
        let zrange = npes / (range * range);
        let (xaxis, yaxis, zaxis) = pe.split_3d(Team::WORLD, range, range, zrange)?;

        for (name, team) in [
            ("xaxis_team", xaxis),
            ("yaxis_team", yaxis),
            ("zaxis_team", zaxis),
        ] {
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

    println!("\n3D split example passed on {npes} PEs");
    Ok(())
}
