use budloc::BuddyAllocator;

fn main() {
    env_logger::init();

    let allocator = BuddyAllocator::new(1 << 20, 32).expect("could not build the allocator");

    let sizes = [1, 100, 1024, 4096];
    let mut addresses = Vec::new();

    for size in sizes {
        let address = allocator.allocate(size).expect("arena exhausted");
        println!("Requested {size} bytes, received address {address:?}");
        addresses.push(address);
    }

    println!("Writing into every block...");
    for (address, size) in addresses.iter().zip(sizes) {
        unsafe { address.as_ptr().write_bytes(0xAB, size) };
    }

    println!("Releasing everything...");
    for address in addresses {
        unsafe { allocator.deallocate(Some(address)) };
    }

    // Everything merged back, so the whole arena is available again.
    let whole = allocator.allocate(1 << 20);
    println!("Whole arena allocation after the release: {whole:?}");
    unsafe { allocator.deallocate(whole) };
}
