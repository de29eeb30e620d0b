//! Strided split example - a team of the even-numbered PEs.
//!
//! Splits the world with the triplet `(0, 2, npes / 2)`; odd PEs get
//! `Team::NULL` back. Each member then reduces its world rank over the new
//! team to check the membership.
//!
//! Run with: cargo run --example split_strided -- 8

use ferroteam::{Config, LocalWorld, Result, SyncBuffer, Team, WorkBuffer};
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
    if npes < 2 {
        eprintln!("This example requires at least 2 PEs");
        return Ok(());
    }
    let world = LocalWorld::new(npes)?.with_config(Config::from_env());

    let results = world.run(|pe| {
        let rank = pe.my_pe();
        let npes = pe.n_pes();

        let even = pe.split_strided(Team::WORLD, 0, 2, npes / 2)?;
        if even != Team::NULL {
            let t_pe = pe.team_rank(even)?;
            let t_size = pe.team_size(even)?;
            println!("Global PE {rank} has team_pe of {t_pe} out of {t_size}");

            let mut sum = [0i32];
            let mut work = WorkBuffer::for_nreduce(1);
            let sync = SyncBuffer::new();
            pe.sum_to_all(even, &mut sum, &[rank], &mut work, &sync)?;
            let expected: i32 = (0..npes / 2).map(|k| 2 * k).sum();
            assert_eq!(sum[0], expected, "PE {rank}: even-team sum mismatch");
        }

        pe.barrier_all()?;
        Ok(())
    });
    results.into_iter().collect::<Result<Vec<()>>>()?;

    println!("\nStrided split example passed on {npes} PEs");
    Ok(())
}
