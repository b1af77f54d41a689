//! Demonstrates the per-request arena pattern: one long-lived server pool,
//! one short-lived child pool per request.
//!
//! Allocation accounting via [`TrackingMemorySource`] shows that every byte a
//! request allocates is back at the memory source the moment its pool is
//! destroyed, without any per-object bookkeeping in the request code.

use cascade_pool::{PoolForest, TrackingMemorySource};

const REQUEST_COUNT: usize = 5;

fn main() {
    let source = TrackingMemorySource::system();
    let stats = source.stats();

    let mut forest = PoolForest::builder().memory_source(source).build();

    let server = forest.create_root();
    forest.set_label(server, "server").expect("server pool is live");

    for request_number in 0..REQUEST_COUNT {
        let request = forest.create_child(server).expect("server pool is live");

        // Request handling allocates freely and never frees.
        for _ in 0..100 {
            _ = forest.allocate(request, 256).expect("request pool is live");
        }

        println!(
            "request {}: {} bytes outstanding at the source",
            request_number,
            stats.outstanding_bytes()
        );

        // One call reclaims everything the request allocated.
        forest.destroy(request).expect("request pool is live");
    }

    forest.destroy(server).expect("server pool is live");

    println!(
        "server torn down; {} bytes outstanding, {} acquires / {} releases",
        stats.outstanding_bytes(),
        stats.acquire_count(),
        stats.release_count()
    );
}
