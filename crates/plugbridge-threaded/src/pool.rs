//! Process-wide pool of DSP worker threads.

use crate::sync::{CachePadded, Semaphore, SpinLock};
use plugbridge_core::BridgeConfig;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

/// Capacity of the task queue
pub const TASK_QUEUE_SIZE: usize = 1024;

static INSTANCE: OnceLock<Arc<DspThreadPool>> = OnceLock::new();

thread_local! {
    static DSP_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is one of the DSP workers
pub fn is_dsp_thread() -> bool {
    DSP_THREAD.with(Cell::get)
}

/// A unit of work executed on a DSP worker
///
/// Tasks are reference counted so that submitting one never allocates.
pub trait PoolTask: Send + Sync {
    fn run(&self);
}

type TaskRef = Arc<dyn PoolTask>;

struct PoolShared {
    producer: CachePadded<SpinLock<rtrb::Producer<TaskRef>>>,
    consumer: CachePadded<SpinLock<rtrb::Consumer<TaskRef>>>,
    semaphore: Semaphore,
    running: AtomicBool,
}

/// Fixed set of worker threads pulling tasks from a bounded queue
///
/// The queue is a single-producer/single-consumer ring buffer with each end
/// behind its own spin lock, which makes it safe for any number of threads
/// on either side. The semaphore is posted exactly once per queued task.
pub struct DspThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl DspThreadPool {
    /// The process-wide pool, created on first use
    ///
    /// The number of workers is taken from [`BridgeConfig::global`].
    pub fn instance() -> &'static Arc<Self> {
        INSTANCE.get_or_init(|| {
            let num_threads = BridgeConfig::global().num_dsp_threads();
            Arc::new(Self::new(num_threads))
        })
    }

    /// Create a pool with its own worker threads.
    ///
    /// Outside this crate the only way to get a pool is [`instance`](Self::instance).
    pub(crate) fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (producer, consumer) = rtrb::RingBuffer::new(TASK_QUEUE_SIZE);
        let shared = Arc::new(PoolShared {
            producer: CachePadded(SpinLock::new(producer)),
            consumer: CachePadded(SpinLock::new(consumer)),
            semaphore: Semaphore::new(0),
            running: AtomicBool::new(true),
        });

        let threads = (0..num_threads)
            .filter_map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("dsp-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .map_err(|e| tracing::error!("Failed to spawn DSP worker {}: {}", i, e))
                    .ok()
            })
            .collect::<Vec<_>>();

        tracing::debug!("DSP thread pool started with {} workers", threads.len());

        Self { shared, threads }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Queue a task. Returns `false` if the queue is full (or there are no
    /// workers); the caller should then run the task itself.
    pub fn push(&self, task: TaskRef) -> bool {
        if self.threads.is_empty() {
            return false;
        }
        let pushed = self.shared.producer.lock().push(task).is_ok();
        if pushed {
            self.shared.semaphore.post(1);
        }
        pushed
    }
}

impl Drop for DspThreadPool {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.semaphore.post(self.threads.len());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("DSP worker panicked");
            }
        }
        tracing::debug!("DSP thread pool stopped");
    }
}

fn worker_loop(shared: &PoolShared) {
    DSP_THREAD.with(|flag| flag.set(true));

    loop {
        shared.semaphore.wait();
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let task = shared.consumer.lock().pop().ok();
        if let Some(task) = task {
            task.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountTask {
        runs: AtomicUsize,
        on_dsp_thread: AtomicBool,
        done: mpsc::SyncSender<()>,
    }

    impl PoolTask for CountTask {
        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.on_dsp_thread.store(is_dsp_thread(), Ordering::SeqCst);
            let _ = self.done.send(());
        }
    }

    #[test]
    fn test_every_task_runs_exactly_once() {
        const TASKS: usize = 200;

        let pool = DspThreadPool::new(4);
        assert_eq!(pool.num_threads(), 4);

        let (done_tx, done_rx) = mpsc::sync_channel(TASKS);
        let tasks: Vec<Arc<CountTask>> = (0..TASKS)
            .map(|_| {
                Arc::new(CountTask {
                    runs: AtomicUsize::new(0),
                    on_dsp_thread: AtomicBool::new(false),
                    done: done_tx.clone(),
                })
            })
            .collect();

        for task in &tasks {
            assert!(pool.push(Arc::clone(task) as TaskRef));
        }
        for _ in 0..TASKS {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("task did not run");
        }
        drop(pool);

        for task in &tasks {
            assert_eq!(task.runs.load(Ordering::SeqCst), 1);
            assert!(task.on_dsp_thread.load(Ordering::SeqCst));
        }
        assert!(!is_dsp_thread());
    }

    #[test]
    fn test_push_from_many_threads() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 16;

        let pool = Arc::new(DspThreadPool::new(2));
        let (done_tx, done_rx) = mpsc::sync_channel(PRODUCERS * PER_PRODUCER);

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let done_tx = done_tx.clone();
                std::thread::spawn(move || {
                    (0..PER_PRODUCER)
                        .map(|_| {
                            let task = Arc::new(CountTask {
                                runs: AtomicUsize::new(0),
                                on_dsp_thread: AtomicBool::new(false),
                                done: done_tx.clone(),
                            });
                            assert!(pool.push(Arc::clone(&task) as TaskRef));
                            task
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let tasks: Vec<Arc<CountTask>> = producers
            .into_iter()
            .flat_map(|producer| producer.join().unwrap())
            .collect();
        drop(done_tx);

        for _ in 0..tasks.len() {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("task did not run");
        }
        // nothing runs twice
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        for task in &tasks {
            assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_full_queue_rejects_push() {
        let pool = DspThreadPool::new(1);
        let release = testing::block_queue(&pool);
        assert!(!pool.push(Arc::new(testing::Noop)));
        release.send(()).unwrap();
    }
}
