//! Exercises the allocator directly through its malloc-family operations
//! and shows the free-list dump and statistics along the way.
//!
//! Run with `MALLOCVERBOSE=NO cargo run --example standalone` to silence
//! the at-exit statistics block.

use tagalloc::Tagalloc;

fn dump(allocator: &Tagalloc) {
    let mut line = String::new();
    allocator.dump_free_list(&mut line).unwrap();
    print!("{line}");
}

fn main() {
    let allocator = Tagalloc::new();

    unsafe {
        println!("Fresh allocator:");
        dump(&allocator);

        let a = allocator.malloc(100);
        let b = allocator.malloc(2048);
        let c = allocator.calloc(64, 8);

        println!("\nThree allocations ({a:?}, {b:?}, {c:?}):");
        dump(&allocator);

        println!("\nUsable sizes: {}, {}, {}",
            allocator.payload_size(a),
            allocator.payload_size(b),
            allocator.payload_size(c),
        );

        let b = allocator.realloc(b, 8192);
        println!("\nAfter growing the middle allocation to 8192 ({b:?}):");
        dump(&allocator);

        allocator.free(a);
        allocator.free(b);
        allocator.free(c);

        println!("\nEverything freed, coalesced back to one block:");
        dump(&allocator);
    }

    let stats = allocator.stats();
    println!(
        "\n{} slab(s), {} bytes obtained from the OS",
        stats.num_slabs, stats.heap_size
    );
}
