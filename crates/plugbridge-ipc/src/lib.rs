//! Out-of-process plugin hosting.
//!
//! Plugins run inside a `plugin-host` child process and talk to the host
//! through a shared memory region that is split into channels:
//! - two UI queues (ring buffers) for editor commands and automation that
//!   happens outside of processing
//! - one non-real-time request channel
//! - one real-time request channel per DSP thread (shared bridges only)
//!
//! Requests are synchronous: the host writes a request, posts an event and
//! waits for the reply that the server writes into the same buffer. If the
//! child dies, the [`WatchDog`] notices, releases every waiter and tells the
//! clients that their plugin crashed.

pub mod bridge;
pub mod channel;
pub mod client;
pub mod host_app;
pub mod interface;
pub mod log_pipe;
pub mod protocol;
pub mod server;
pub mod shm;
pub mod watchdog;

pub use bridge::{Channel, NrtChannel, PluginBridge, RtChannel};
pub use channel::{ChannelKind, ChannelSpec, ShmChannel};
pub use client::PluginClient;
pub use host_app::{
    CpuArch, HostApp, ProcessHandle, ProcessHostApp, ThreadHostApp, host_app, register_host_app,
};
pub use interface::ShmInterface;
pub use protocol::{ProtocolError, ShmCommand, UiCommand, UiMessage};
pub use server::{BuiltinLoader, PluginLoader, PluginServer};
pub use shm::SharedMemory;
pub use watchdog::{Supervised, WatchDog};
