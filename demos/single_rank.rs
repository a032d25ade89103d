//! Single-rank demo: every record loops back to the local store

use std::sync::Arc;

use record_shuffle::prelude::*;
use record_shuffle::transport::Mesh;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    println!("=== Single-Rank Shuffle Demo ===\n");

    let cfg = ShuffleConfig::from_env().with_store_dir("/tmp/particles");
    let nexus = Arc::new(StaticNexus::single_node(
        0,
        1,
        &cfg.transport_proto,
        &cfg.subnet,
    )?);
    let mesh = Mesh::new();

    let delivery: Arc<dyn Delivery> =
        Arc::new(|path: &str, payload: &[u8], epoch: u16| {
            println!(
                "deliver {} ({} bytes, epoch {})",
                path,
                payload.len(),
                epoch
            );
            Ok(())
        });

    let shuffle = Shuffle::new(cfg, nexus, Arc::new(mesh.endpoint(0)), delivery)?;

    for epoch in 0..2u16 {
        shuffle.epoch_start(epoch)?;
        for i in 0..8 {
            let fname = format!("p{}", i);
            let payload = format!("particle {} state at epoch {}", i, epoch);
            shuffle.write(&fname, payload.as_bytes(), epoch)?;
        }
        shuffle.epoch_end(epoch)?;
        println!("epoch {} drained", epoch);
    }

    let stats = shuffle.finalize()?;
    println!("\ndelivered {} records locally", stats.delivered);

    Ok(())
}
