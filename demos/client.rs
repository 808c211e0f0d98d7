//! A user defined type whose instances live inside a process wide buddy
//! arena instead of the system heap. The pool is built exactly once, on
//! first use, and both allocation and release go through that same instance.

use std::{
    mem,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::OnceLock,
};

use budloc::BuddyAllocator;

/// The process wide pool. [`pool`] is the only place that constructs it.
static POOL: OnceLock<BuddyAllocator> = OnceLock::new();

/// 1 MiB arena with 32 byte blocks, built on first use.
fn pool() -> &'static BuddyAllocator {
    POOL.get_or_init(|| {
        BuddyAllocator::new(1024 * 1024, 32).expect("could not build the widget pool")
    })
}

/// Owning handle to a `T` stored in the pool. Construction allocates a block
/// big enough for `T`, dropping the handle runs `T`'s destructor and gives
/// the block back.
struct Pooled<T> {
    address: NonNull<T>,
}

impl<T> Pooled<T> {
    /// Moves `value` into the pool. `None` if the pool is exhausted.
    fn new(value: T) -> Option<Self> {
        // Blocks are aligned to their own (power of two) size, so asking
        // for at least `align_of::<T>()` bytes also covers alignment.
        let size = mem::size_of::<T>().max(mem::align_of::<T>());
        let address = pool().allocate(size)?.cast::<T>();

        unsafe { address.as_ptr().write(value) };

        Some(Self { address })
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.address.as_ref() }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.address.as_mut() }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        unsafe {
            self.address.as_ptr().drop_in_place();
            pool().deallocate(Some(self.address.cast()));
        }
    }
}

#[derive(PartialEq)]
struct Widget {
    x: i32,
    y: f64,
    z: String,
}

impl Widget {
    fn product(&self) -> f64 {
        self.x as f64 * self.y
    }
}

fn main() {
    env_logger::init();

    let mut first = Pooled::new(Widget {
        x: 5,
        y: 3.14,
        z: String::from("Hello"),
    })
    .expect("pool exhausted");

    let second = Pooled::new(Widget {
        x: 10,
        y: 2.71,
        z: String::from("World"),
    })
    .expect("pool exhausted");

    first.x = 15;

    println!("first: x = {}, y = {}, z = {}", first.x, first.y, first.z);
    println!("second: x = {}, y = {}, z = {}", second.x, second.y, second.z);

    println!("first.product() = {}", first.product());
    println!("second.product() = {}", second.product());

    if *first == *second {
        println!("the widgets are equal");
    } else {
        println!("the widgets are not equal");
    }

    // Both handles drop here and their blocks flow back into the pool.
}
