//! Demonstrates the teardown ordering guarantees: children before the
//! parent's own cleanups, reverse-registration order within a pool, and the
//! pre-cleanup phase that runs while the subtree is still intact.

use cascade_pool::PoolForest;

fn main() {
    let mut forest = PoolForest::new();

    let transaction = forest.create_root();
    let statement = forest
        .create_child(transaction)
        .expect("transaction pool is live");

    // Acquisition order: lock file, then open cursor. Release order must be
    // the reverse, which reverse-registration execution provides.
    forest
        .register_cleanup(transaction, || {
            println!("3. unlocking the journal file");
            Ok(())
        })
        .expect("transaction pool is live");
    forest
        .register_cleanup(transaction, || {
            println!("2. closing the cursor");
            Ok(())
        })
        .expect("transaction pool is live");

    // The statement pool's resources go away before the transaction's own,
    // because children are torn down first.
    forest
        .register_cleanup(statement, || {
            println!("1. discarding the statement cache");
            Ok(())
        })
        .expect("statement pool is live");

    // A pre-cleanup runs before any child is touched.
    forest
        .register_pre_cleanup(transaction, || {
            println!("0. notifying observers while everything still exists");
            Ok(())
        })
        .expect("transaction pool is live");

    forest.destroy(transaction).expect("cleanups succeed");
}
