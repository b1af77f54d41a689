//! The walk-through from the crate documentation: one request pool, one
//! child pool for a processing phase, cleanups tied to the request lifetime.

use cascade_pool::PoolForest;

fn main() {
    let mut forest = PoolForest::new();

    // A root pool for the lifetime of one request.
    let request = forest.create_root();

    // A child pool for a parsing phase; torn down before the request pool.
    let parser = forest.create_child(request).expect("request pool is live");

    // Bump-allocate scratch memory; individual regions are never freed.
    let scratch = forest.allocate(parser, 4096).expect("parser pool is live");
    println!("allocated {} bytes of parser scratch", scratch.len());

    // Callbacks run in reverse-registration order: the connection closes
    // before the log flushes.
    forest
        .register_cleanup(request, || {
            println!("flushing the request log");
            Ok(())
        })
        .expect("request pool is live");
    forest
        .register_cleanup(request, || {
            println!("closing the connection");
            Ok(())
        })
        .expect("request pool is live");

    // One call tears down the parser pool, runs both callbacks and returns
    // every slab to the memory source.
    forest.destroy(request).expect("cleanups succeed");

    println!("request torn down; {} pools remain", forest.pool_count());
}
