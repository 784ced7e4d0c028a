//! Walks a one page heap through a few allocations and releases, printing the
//! block list after each step. Run with `RUST_LOG=trace` to also see every
//! split and coalesce.

use tagheap::Heap;

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut heap = Heap::new();
    heap.init(4096)?;
    heap.print()?;

    let a = heap.allocate(100)?.as_ptr();
    log_alloc(a, 100);
    let b = heap.allocate(8)?.as_ptr();
    log_alloc(b, 8);
    let c = heap.allocate(16)?.as_ptr();
    log_alloc(c, 16);
    heap.print()?;

    // Too big for what's left. The heap is untouched.
    if let Err(err) = heap.allocate(heap.capacity() - 100) {
        println!("Allocation failed: {err}");
    }

    heap.release(b)?;
    println!("Released {b:?}");
    heap.print()?;

    // Coalesces with the free block on each side.
    heap.release(a)?;
    heap.release(c)?;
    println!("Released {a:?} and {c:?}");
    heap.print()?;

    if let Err(err) = heap.release(a) {
        println!("Second release of {a:?} failed: {err}");
    }

    heap.check()?;

    Ok(())
}
