//! Run plugins on a pool of DSP worker threads.
//!
//! A [`ThreadedPlugin`] wraps any [`Plugin`](plugbridge_plugin::Plugin) and
//! hands each processing block to the process-wide [`DspThreadPool`]. The
//! host's audio thread can then drive several plugins that process in
//! parallel while it waits on each of them.
//!
//! The synchronization primitives in [`sync`] and the [`DoubleBuffer`] are
//! also used by the IPC bridge.

mod double_buffer;
mod plugin;
mod pool;
pub mod sync;

#[cfg(test)]
mod alloc_count;

pub use double_buffer::DoubleBuffer;
pub use plugin::ThreadedPlugin;
pub use pool::{DspThreadPool, PoolTask, TASK_QUEUE_SIZE, is_dsp_thread};
