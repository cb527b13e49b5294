//! Background thread that keeps an eye on running bridges.
//!
//! Every interval it forwards their log output and checks whether their host
//! process is still alive. Bridges are held weakly and forgotten once they
//! are dropped.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use plugbridge_core::BridgeConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Something the watchdog polls periodically
pub trait Supervised: Send + Sync {
    fn poll(&self);
}

pub struct WatchDog {
    sender: Sender<Weak<dyn Supervised>>,
    watched: Arc<AtomicUsize>,
}

impl WatchDog {
    /// The process-wide watchdog, started on first use
    pub fn instance() -> &'static WatchDog {
        static INSTANCE: OnceLock<WatchDog> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let interval = Duration::from_millis(BridgeConfig::global().watchdog_interval_ms);
            WatchDog::new(interval)
        })
    }

    /// Start a watchdog thread. It exits when the watchdog is dropped.
    pub fn new(interval: Duration) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let watched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&watched);
        let spawned = std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || run(receiver, interval, counter));
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn watchdog thread: {}", e);
        }
        Self { sender, watched }
    }

    pub fn register(&self, item: Weak<dyn Supervised>) {
        if self.sender.send(item).is_err() {
            tracing::error!("Watchdog thread is gone");
        }
    }

    /// Number of live items as of the last poll
    pub fn num_watched(&self) -> usize {
        self.watched.load(Ordering::Relaxed)
    }
}

fn run(receiver: Receiver<Weak<dyn Supervised>>, interval: Duration, watched: Arc<AtomicUsize>) {
    let mut items: Vec<Weak<dyn Supervised>> = Vec::new();
    loop {
        if items.is_empty() {
            // nothing to do until somebody registers
            match receiver.recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items.extend(receiver.try_iter());

        items.retain(|item| match item.upgrade() {
            Some(item) => {
                item.poll();
                true
            }
            None => false,
        });
        watched.store(items.len(), Ordering::Relaxed);

        match receiver.recv_timeout(interval) {
            Ok(item) => items.push(item),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("Watchdog stopped");
}
