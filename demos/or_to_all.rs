//! Team OR reduction example.
//!
//! Every PE contributes `(rank + 1) % 4` in each of 3 slots and ORs them over
//! the world team. With 4 or more PEs every slot ends up as 3.
//!
//! Run with: cargo run --example or_to_all -- 4

use ferroteam::{Config, LocalWorld, Result, SyncBuffer, Team, WorkBuffer, REDUCE_SYNC_SIZE};
use tracing_subscriber::EnvFilter;

const N: usize = 3;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let npes = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);
    let world = LocalWorld::new(npes)?.with_config(Config::from_env());

    let results = world.run(|pe| {
        let me = pe.my_pe();

        let sync = SyncBuffer::with_len(REDUCE_SYNC_SIZE);
        let mut work = WorkBuffer::for_nreduce(N);
        let source = [(me + 1) % 4; N];
        let mut dest = [0i32; N];

        pe.barrier_all()?;
        pe.or_to_all(Team::WORLD, &mut dest, &source, &mut work, &sync)?;

        for (i, value) in dest.iter().enumerate() {
            println!("[PE:{me}] dest[{i}]={value}");
        }

        pe.barrier_all()?;
        Ok(dest)
    });

    let dests = results.into_iter().collect::<Result<Vec<_>>>()?;
    if dests.windows(2).all(|pair| pair[0] == pair[1]) {
        println!("\nAll {npes} PEs hold {:?}", dests[0]);
    }
    Ok(())
}
