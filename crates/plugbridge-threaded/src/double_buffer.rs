//! Multi-producer queue with a single swapping consumer.

use crate::sync::{CachePadded, SpinLock};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Two spin-locked vectors; producers append to the active one and the
/// consumer swaps them and drains the one that was active.
///
/// Producers never see a drained slot: after taking a slot lock they check
/// the active index again and retry when it changed underneath them.
pub struct DoubleBuffer<T> {
    current: AtomicUsize,
    slots: [CachePadded<SpinLock<Vec<T>>>; 2],
}

impl<T> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> DoubleBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            slots: [
                CachePadded(SpinLock::new(Vec::with_capacity(capacity))),
                CachePadded(SpinLock::new(Vec::with_capacity(capacity))),
            ],
        }
    }

    /// Append a value to the active slot
    pub fn push(&self, value: T) {
        loop {
            let index = self.current.load(Ordering::Acquire);
            let mut slot = self.slots[index].lock();
            if self.current.load(Ordering::Acquire) == index {
                slot.push(value);
                return;
            }
        }
    }

    /// Make the other slot active and move everything from the previously
    /// active slot into `out`, in push order.
    ///
    /// Only one thread may swap at a time.
    pub fn swap(&self, out: &mut Vec<T>) {
        let old = self.current.fetch_xor(1, Ordering::AcqRel);
        let mut slot = self.slots[old].lock();
        out.append(&mut slot);
    }

    /// Drop everything in both slots
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_push_order() {
        let buffer = DoubleBuffer::with_capacity(4);
        buffer.push(1);
        buffer.push(2);
        buffer.push(3);

        let mut out = Vec::new();
        buffer.swap(&mut out);
        assert_eq!(out, vec![1, 2, 3]);

        out.clear();
        buffer.swap(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_concurrent_push_and_swap_loses_nothing() {
        const WRITERS: usize = 4;
        const PER_WRITER: usize = 20_000;

        let buffer = Arc::new(DoubleBuffer::with_capacity(1024));
        let writers_done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        buffer.push((w, i));
                    }
                })
            })
            .collect();

        let consumer = {
            let buffer = Arc::clone(&buffer);
            let writers_done = Arc::clone(&writers_done);
            thread::spawn(move || {
                let mut seen = Vec::new();
                let mut out = Vec::new();
                loop {
                    let finished = writers_done.load(Ordering::Acquire);
                    buffer.swap(&mut out);
                    seen.append(&mut out);
                    if finished {
                        // pick up what was pushed since the last swap
                        buffer.swap(&mut out);
                        seen.append(&mut out);
                        return seen;
                    }
                    thread::yield_now();
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        writers_done.store(true, Ordering::Release);
        let seen = consumer.join().unwrap();

        assert_eq!(seen.len(), WRITERS * PER_WRITER);

        // per-writer order is preserved and nothing is duplicated
        let mut next = [0usize; WRITERS];
        for (w, i) in seen {
            assert_eq!(i, next[w]);
            next[w] += 1;
        }
        assert!(next.iter().all(|&n| n == PER_WRITER));
    }
}
