//! Synchronization primitives for the DSP threads.

use parking_lot::lock_api::{self, GuardSend, RawMutex};
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Spin iterations before yielding the time slice
const SPIN_LIMIT: u32 = 1000;

/// A test-and-test-and-set spin lock
///
/// Never parks the thread, so it can be taken on the audio thread as long
/// as the critical sections are short.
pub struct RawSpinLock {
    locked: AtomicBool,
}

#[allow(unsafe_code)]
unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let mut spins = 0;
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPIN_LIMIT {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// Aligns a value to its own cache line
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CachePadded<T>(pub T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Counting semaphore
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self, n: usize) {
        let mut count = self.count.lock();
        *count += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

/// Auto-reset event: `wait` returns once per `set`
#[derive(Default)]
pub struct SyncEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl SyncEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cond.wait(&mut state);
        }
        *state = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spin_lock_counts() {
        let counter = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 40_000);
    }

    #[test]
    fn test_spin_lock_try_lock() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_cache_padding() {
        assert_eq!(std::mem::align_of::<CachePadded<SpinLock<u8>>>(), 64);
    }

    #[test]
    fn test_semaphore() {
        let sem = Arc::new(Semaphore::new(0));
        assert!(!sem.try_wait());

        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.wait();
                sem.wait();
            })
        };
        sem.post(2);
        waiter.join().unwrap();
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_semaphore_wakes_one_waiter_per_count() {
        use std::sync::atomic::AtomicUsize;
        use std::time::{Duration, Instant};

        let sem = Arc::new(Semaphore::new(0));
        let woken = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let woken = Arc::clone(&woken);
                thread::spawn(move || {
                    sem.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        sem.post(2);
        let deadline = Instant::now() + Duration::from_secs(5);
        while woken.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), 2);

        sem.post(1);
        sem.post(1);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_sync_event_auto_reset() {
        let event = Arc::new(SyncEvent::new());
        event.set();
        event.wait();

        let setter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.set())
        };
        event.wait();
        setter.join().unwrap();
    }
}
