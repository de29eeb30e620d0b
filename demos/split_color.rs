//! Color split example - split the world into even and odd teams.
//!
//! Every PE supplies `color = rank % 2` and `key = rank`, so each team keeps
//! the world ordering of its members.
//!
//! Run with: cargo run --example split_color -- 8

use ferroteam::{Config, LocalWorld, Result, Team};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let npes = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(8);
    let world = LocalWorld::new(npes)?.with_config(Config::from_env());

    let results = world.run(|pe| {
        let rank = pe.my_pe();

        let color = rank % 2;
        let team = pe.split_color(Team::WORLD, color, rank)?;
        if team != Team::NULL {
            let t_pe = pe.team_rank(team)?;
            let t_size = pe.team_size(team)?;
            let group_name = if color == 0 { "even" } else { "odd" };
            println!("Global PE {rank} has team_pe of {t_pe} out of {t_size} ({group_name})");
            assert_eq!(t_pe, rank / 2);
        }

        pe.barrier_all()?;
        Ok(())
    });
    results.into_iter().collect::<Result<Vec<()>>>()?;

    println!("\nColor split example passed on {npes} PEs");
    Ok(())
}
