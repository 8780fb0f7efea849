//! Passivation Example
//!
//! Builds a file-backed index with a deliberately small node cache, then shows
//! that nodes evicted under memory pressure are reloaded transparently and that
//! the index survives a reopen.

use spatree::{Envelope, IndexConfig, SpatialIndex, SyncPolicy};
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    println!("=== Passivating R-tree ===\n");

    let dir = tempfile::tempdir()?;
    let config = IndexConfig::default()
        .with_fanout(4, 16)
        .with_cache_bytes(16 * 1024);

    {
        let index = SpatialIndex::builder()
            .config(config.clone())
            .path(dir.path())
            .sync_policy(SyncPolicy::Always)
            .build()?;

        println!("1. Inserting 5,000 parcels");
        for i in 0..5_000 {
            let x = (i % 100) as f64;
            let y = (i / 100) as f64;
            index.insert(
                Envelope::rect(x, y, x + 0.8, y + 0.8),
                format!("parcel-{}", i),
            )?;
        }

        let stats = index.stats();
        println!("   height:          {}", stats.height);
        println!("   identifiers:     {}", stats.identifiers);
        println!("   resident nodes:  {}", stats.cache.resident_nodes);
        println!("   resident bytes:  {}", stats.cache.resident_bytes);
        println!("   evictions:       {}\n", stats.cache.evictions);

        println!("2. Querying a window (some nodes come back from disk)");
        let window = Envelope::rect(10.0, 10.0, 12.0, 12.0);
        let hits = index.query_to_vec(&window)?;
        println!("   {} parcels intersect {:?}", hits.len(), window);
        let stats = index.stats();
        println!(
            "   cache hit rate: {:.1}% ({} misses)\n",
            stats.cache.hit_rate() * 100.0,
            stats.cache.misses
        );

        println!("3. Passivating everything");
        let dropped = index.passivate_all()?;
        println!("   dropped {} resident bodies", dropped);

        index.delete(&Envelope::rect(0.0, 0.0, 0.8, 0.8), "parcel-0")?;
        println!("   deleted parcel-0, {} entries left\n", index.len());
    }

    println!("4. Reopening from {}", dir.path().display());
    let index = SpatialIndex::open(dir.path(), config)?;
    let tree = index.validate()?;
    println!(
        "   {} entries in {} nodes ({} leaves), height {}",
        tree.entry_count, tree.node_count, tree.leaf_count, tree.height
    );
    println!("   storage: {:?}", index.stats().storage);

    Ok(())
}
