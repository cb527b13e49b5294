//! Heap allocation checks for commands on the real-time path.
//!
//! Counters are per thread, so tests running in parallel don't disturb
//! each other.

use crate::DoubleBuffer;
use plugbridge_comms::{Command, MAX_SHORT_STRING_SIZE};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

struct CountingAllocator;

thread_local! {
    static ALLOCS: Cell<usize> = const { Cell::new(0) };
    static DEALLOCS: Cell<usize> = const { Cell::new(0) };
}

fn bump(counter: &'static std::thread::LocalKey<Cell<usize>>) {
    let _ = counter.try_with(|c| c.set(c.get() + 1));
}

#[allow(unsafe_code)]
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        bump(&ALLOCS);
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        bump(&DEALLOCS);
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

/// Run `f` and return (allocations, deallocations) made on this thread
fn count<R>(f: impl FnOnce() -> R) -> (R, usize, usize) {
    let allocs = ALLOCS.with(Cell::get);
    let deallocs = DEALLOCS.with(Cell::get);
    let result = f();
    (
        result,
        ALLOCS.with(Cell::get) - allocs,
        DEALLOCS.with(Cell::get) - deallocs,
    )
}

#[test]
fn test_short_string_command_never_allocates() {
    let short = "x".repeat(MAX_SHORT_STRING_SIZE);

    let (command, allocs, _) = count(|| Command::param_string(3, 0, &short));
    assert_eq!(allocs, 0);

    let ((), _, deallocs) = count(|| drop(command));
    assert_eq!(deallocs, 0);

    let (name, allocs, _) = count(|| Command::program_name("Init"));
    assert_eq!(allocs, 0);
    drop(name);
}

#[test]
fn test_long_string_command_allocates_once() {
    let long = "x".repeat(MAX_SHORT_STRING_SIZE + 1);

    let (command, allocs, _) = count(|| Command::param_string(3, 0, &long));
    assert_eq!(allocs, 1);

    let ((), _, deallocs) = count(|| drop(command));
    assert_eq!(deallocs, 1);
}

#[test]
fn test_sysex_command_allocates_once() {
    let payload = [0xf0, 0x43, 0x10, 0x4c, 0xf7];

    let (command, allocs, _) = count(|| Command::sysex(&payload, 0));
    assert_eq!(allocs, 1);

    let ((), _, deallocs) = count(|| drop(command));
    assert_eq!(deallocs, 1);
}

#[test]
fn test_queueing_short_commands_is_allocation_free() {
    let buffer = DoubleBuffer::with_capacity(64);
    let mut scratch: Vec<Command> = Vec::with_capacity(64);

    let ((), allocs, deallocs) = count(|| {
        for i in 0..32 {
            buffer.push(Command::SetParamValue {
                index: i,
                offset: 0,
                value: 0.5,
            });
            buffer.push(Command::param_string(i, 0, "-3.0 dB"));
        }
        buffer.swap(&mut scratch);
        scratch.clear();
    });
    assert_eq!(allocs, 0);
    assert_eq!(deallocs, 0);
}

#[test]
fn test_discarded_long_commands_are_released() {
    let buffer = DoubleBuffer::with_capacity(8);
    buffer.push(Command::param_string(0, 0, "a string that is too long"));
    buffer.push(Command::program_name("another long program name"));

    let ((), _, deallocs) = count(|| buffer.clear());
    assert_eq!(deallocs, 2);
}
