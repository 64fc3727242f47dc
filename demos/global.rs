//! Installs the allocator as the Rust global allocator. Every collection in
//! this program lives in tagalloc-managed slabs.
//!
//! Note that alignment beyond 8 bytes is out of scope for this allocator,
//! so stick to types with natural alignment.

use tagalloc::Tagalloc;

#[global_allocator]
static ALLOCATOR: Tagalloc = Tagalloc::new();

fn main() {
    let num = Box::new(5u64);
    assert_eq!(*num, 5);

    let mut values = Vec::new();
    for i in 0..10_000u64 {
        values.push(i);
    }
    assert_eq!(values.iter().sum::<u64>(), 49_995_000);

    let sentence: String = ["all", "slabs", "are", "ours"].join(" ");
    println!("{sentence}: {} elements pushed", values.len());

    drop(values);

    let stats = ALLOCATOR.stats();
    println!(
        "{} mallocs, {} reallocs, {} frees over {} slab(s)",
        stats.malloc_calls, stats.realloc_calls, stats.free_calls, stats.num_slabs
    );
}
