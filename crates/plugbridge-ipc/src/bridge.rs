//! Host side of a bridge: the shared memory, the host process and the
//! registry of clients that live in it.
//!
//! A *shared* bridge hosts any number of plugins for one architecture and
//! has one non-real-time channel plus one real-time channel per DSP thread.
//! A *sandbox* bridge hosts a single plugin and has one request channel
//! that serves both purposes.

use crate::channel::{ChannelSpec, ShmChannel};
use crate::host_app::{CpuArch, HostApp, ProcessHandle, host_app};
use crate::interface::{MAX_NUM_CHANNELS, ShmInterface};
use crate::log_pipe::{LogReader, create_pipe};
use crate::protocol::{
    ProtocolError, ShmCommand, UiCommand, UiMessage, add_audio, add_command, decode, decode_ui,
    encode_ui,
};
use crate::watchdog::{Supervised, WatchDog};
use parking_lot::{Mutex, MutexGuard};
use plugbridge_core::{BridgeConfig, Sample};
use plugbridge_plugin::{PluginError, PluginListener};
use plugbridge_threaded::sync::{CachePadded, SpinLock, SpinLockGuard};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

/// UI messages from the host to the plugins (the server receives on it)
pub const UI_SEND_CHANNEL: usize = 0;
/// UI messages from the plugins to the host (the server sends on it)
pub const UI_RECEIVE_CHANNEL: usize = 1;
/// Non-real-time requests; the only request channel of a sandbox bridge
pub const NRT_CHANNEL: usize = 2;
/// Index of the first request channel
pub const FIRST_REQUEST_CHANNEL: usize = NRT_CHANNEL;

/// How long to wait for the host process after asking it to quit
const QUIT_TIMEOUT: Duration = Duration::from_secs(3);

static SHARED_BRIDGES: LazyLock<Mutex<HashMap<CpuArch, Weak<PluginBridge>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static NEXT_RT_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Preferred real-time channel of this thread
    static RT_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

fn thread_rt_index() -> usize {
    RT_INDEX.with(|cell| {
        cell.get().unwrap_or_else(|| {
            let index = NEXT_RT_INDEX.fetch_add(1, Ordering::Relaxed);
            cell.set(Some(index));
            index
        })
    })
}

enum ChannelLock<'a> {
    Spin(SpinLockGuard<'a, ()>),
    Mutex(MutexGuard<'a, ()>),
}

/// Exclusive access to one request channel.
///
/// Acquiring it clears whatever the previous holder left behind; the lock
/// is released when it goes out of scope. Replies borrow the guard, so
/// they can't be read once the channel is handed to someone else:
///
/// ```compile_fail
/// # fn f(bridge: &plugbridge_ipc::PluginBridge) {
/// let reply = {
///     let channel = bridge.nrt_channel();
///     channel.get_reply()
/// };
/// # }
/// ```
pub struct Channel<'a> {
    channel: &'a ShmChannel,
    bridge: &'a PluginBridge,
    _lock: ChannelLock<'a>,
}

/// A channel for the audio thread
pub type RtChannel<'a> = Channel<'a>;

/// A channel for everything else
pub type NrtChannel<'a> = Channel<'a>;

impl<'a> Channel<'a> {
    fn new(bridge: &'a PluginBridge, index: usize, lock: ChannelLock<'a>) -> Self {
        let channel = bridge.shm.channel(index);
        channel.clear();
        Self {
            channel,
            bridge,
            _lock: lock,
        }
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn capacity(&self) -> usize {
        self.channel.capacity()
    }

    /// Append a control message. Returns `false` if it doesn't fit.
    pub fn add_command(&mut self, command: &ShmCommand) -> bool {
        add_command(self.channel, command)
    }

    /// Append one channel of audio. Returns `false` if it doesn't fit.
    pub fn add_audio(&mut self, samples: &[Sample]) -> bool {
        add_audio(self.channel, samples)
    }

    /// Hand the request to the server and wait for the reply.
    ///
    /// Fails with [`PluginError::Crashed`] if the host process is gone or
    /// died while we were waiting.
    pub fn send(&self) -> Result<(), PluginError> {
        if !self.bridge.alive() {
            return Err(PluginError::Crashed);
        }
        self.channel.post();
        self.channel.wait_reply();
        if self.bridge.alive() {
            Ok(())
        } else {
            Err(PluginError::Crashed)
        }
    }

    /// Like [`send`](Self::send), but gives up after `timeout`.
    ///
    /// Returns `true` if the reply arrived while the host was alive.
    pub(crate) fn send_timeout(&self, timeout: Duration) -> bool {
        if !self.bridge.alive() {
            return false;
        }
        self.channel.post();
        self.channel.wait_reply_timeout(timeout) && self.bridge.alive()
    }

    /// Next raw reply message
    pub fn get_reply(&self) -> Option<&[u8]> {
        self.channel.get_message()
    }

    /// Next reply message, decoded
    pub fn get_command(&self) -> Option<Result<ShmCommand<'_>, ProtocolError>> {
        self.get_reply().map(decode)
    }

    /// Turn an error reply into an error.
    ///
    /// Leaves the read position at the start of the reply otherwise.
    pub fn check_error(&self) -> Result<(), PluginError> {
        self.channel.reset();
        if let Some(Ok(ShmCommand::Error { code, message })) = self.get_command() {
            return Err(PluginError::from_code(code, message));
        }
        self.channel.reset();
        Ok(())
    }
}

/// The host side of one bridge process
pub struct PluginBridge {
    shm: ShmInterface,
    arch: CpuArch,
    shared: bool,
    alive: AtomicBool,
    process: Mutex<ProcessHandle>,
    log: Mutex<LogReader>,
    rt_locks: Box<[CachePadded<SpinLock<()>>]>,
    nrt_lock: Mutex<()>,
    ui_send_lock: Mutex<()>,
    ui_buffer: Mutex<Vec<u8>>,
    clients: Mutex<HashMap<u32, Arc<dyn PluginListener>>>,
}

impl PluginBridge {
    /// The shared bridge for `arch`, started on first use and restarted
    /// if it died
    pub fn get_shared(arch: CpuArch) -> Result<Arc<Self>, PluginError> {
        let mut bridges = SHARED_BRIDGES.lock();
        if let Some(bridge) = bridges.get(&arch).and_then(Weak::upgrade) {
            if bridge.alive() {
                return Ok(bridge);
            }
            tracing::warn!("Shared {} bridge died, starting a new one", arch);
        }
        let bridge = Self::create_with(host_app(arch)?.as_ref(), true)?;
        bridges.insert(arch, Arc::downgrade(&bridge));
        Ok(bridge)
    }

    /// A new sandbox bridge for a single plugin
    pub fn create(arch: CpuArch) -> Result<Arc<Self>, PluginError> {
        Self::create_with(host_app(arch)?.as_ref(), false)
    }

    /// Start a bridge through a specific host app
    pub fn create_with(host: &dyn HostApp, shared: bool) -> Result<Arc<Self>, PluginError> {
        let config = BridgeConfig::global();

        let mut specs = vec![
            ChannelSpec::queue("ui_snd", config.queue_size),
            ChannelSpec::queue("ui_rcv", config.queue_size),
        ];
        let num_rt = if shared {
            let num_rt = config
                .num_dsp_threads()
                .clamp(1, MAX_NUM_CHANNELS - specs.len() - 1);
            specs.push(ChannelSpec::request("nrt", config.nrt_request_size));
            for i in 1..=num_rt {
                specs.push(ChannelSpec::request(&format!("rt{i}"), config.rt_request_size));
            }
            num_rt
        } else {
            specs.push(ChannelSpec::request(
                "rt",
                config.rt_request_size.max(config.nrt_request_size),
            ));
            1
        };

        let shm = ShmInterface::create(&specs)?;

        let (log_read, log_write) = create_pipe()
            .map_err(|e| PluginError::SystemError(format!("Couldn't create log pipe: {e}")))?;
        let process = host.bridge(shm.path(), &log_write)?;
        // only the host keeps the write end
        drop(log_write);

        tracing::debug!(
            "Created {} {} bridge {} ({} real-time channels)",
            if shared { "shared" } else { "sandbox" },
            host.arch(),
            shm.path(),
            num_rt
        );

        let bridge = Arc::new(Self {
            shm,
            arch: host.arch(),
            shared,
            alive: AtomicBool::new(true),
            process: Mutex::new(process),
            log: Mutex::new(LogReader::new(log_read)),
            rt_locks: (0..num_rt)
                .map(|_| CachePadded(SpinLock::new(())))
                .collect(),
            nrt_lock: Mutex::new(()),
            ui_send_lock: Mutex::new(()),
            ui_buffer: Mutex::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
        });

        WatchDog::instance().register(Arc::downgrade(&bridge) as Weak<dyn Supervised>);

        Ok(bridge)
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn arch(&self) -> CpuArch {
        self.arch
    }

    /// Name of the shared memory object
    pub fn shm_path(&self) -> &str {
        self.shm.path()
    }

    pub fn num_rt_channels(&self) -> usize {
        self.rt_locks.len()
    }

    /// Get a real-time channel for the calling thread.
    ///
    /// Each thread prefers its own channel and moves on to the next free one
    /// when that is taken. Never blocks in the kernel.
    pub fn rt_channel(&self) -> RtChannel<'_> {
        if !self.shared {
            return Channel::new(self, NRT_CHANNEL, ChannelLock::Spin(self.rt_locks[0].lock()));
        }
        let count = self.rt_locks.len();
        let start = thread_rt_index() % count;
        let mut index = start;
        loop {
            if let Some(guard) = self.rt_locks[index].try_lock() {
                return Channel::new(self, NRT_CHANNEL + 1 + index, ChannelLock::Spin(guard));
            }
            index = (index + 1) % count;
            if index == start {
                std::hint::spin_loop();
            }
        }
    }

    /// Get the non-real-time channel
    pub fn nrt_channel(&self) -> NrtChannel<'_> {
        if self.shared {
            Channel::new(self, NRT_CHANNEL, ChannelLock::Mutex(self.nrt_lock.lock()))
        } else {
            Channel::new(self, NRT_CHANNEL, ChannelLock::Spin(self.rt_locks[0].lock()))
        }
    }

    /// Notice a dead host process.
    ///
    /// Happens exactly once: waiters are released and every client is told
    /// that its plugin crashed.
    pub fn check_status(&self) {
        if !self.alive() || self.process.lock().check_if_running() {
            return;
        }
        if self.alive.swap(false, Ordering::AcqRel) {
            tracing::error!("Plugin bridge {} crashed", self.shm.path());

            for channel in &self.shm.channels()[FIRST_REQUEST_CHANNEL..] {
                channel.post_reply();
            }

            let clients: Vec<_> = self.clients.lock().values().cloned().collect();
            for client in clients {
                client.plugin_crashed();
            }
        }
    }

    /// Kill the host process. The watchdog reports the crash as usual.
    pub fn terminate(&self) -> bool {
        self.process.lock().terminate()
    }

    /// Forward log records from the host process
    pub fn read_log(&self, loud: bool) {
        self.log.lock().read_available(loud);
    }

    pub fn add_ui_client(&self, id: u32, listener: Arc<dyn PluginListener>) {
        self.clients.lock().insert(id, listener);
    }

    pub fn remove_ui_client(&self, id: u32) {
        self.clients.lock().remove(&id);
    }

    /// Send a UI message to a plugin
    pub fn post_ui_thread(&self, message: &UiMessage) {
        let posted = match encode_ui(message) {
            Ok(bytes) => {
                let _guard = self.ui_send_lock.lock();
                self.shm.channel(UI_SEND_CHANNEL).write_message(&bytes)
            }
            Err(e) => {
                tracing::error!("Couldn't encode UI message: {}", e);
                false
            }
        };
        if !posted {
            tracing::error!("Couldn't post {:?} for plugin {}", message.command, message.id);
        }
    }

    /// Deliver UI messages from the plugins to their listeners.
    ///
    /// Call this regularly from the UI thread.
    pub fn poll_ui_thread(&self) {
        let mut buffer = self.ui_buffer.lock();
        let channel = self.shm.channel(UI_RECEIVE_CHANNEL);
        while channel.read_message(&mut buffer) {
            let message = match decode_ui(&buffer) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Bad UI message: {}", e);
                    continue;
                }
            };
            let client = self.clients.lock().get(&message.id).cloned();
            let Some(client) = client else {
                tracing::debug!("UI message for unknown plugin {}", message.id);
                continue;
            };
            match message.command {
                UiCommand::ParamAutomated { index, value } => {
                    client.parameter_automated(index as usize, value);
                }
                UiCommand::LatencyChanged(samples) => client.latency_changed(samples),
                UiCommand::UpdateDisplay => client.update_display(),
                other => tracing::debug!("Unexpected UI command {:?}", other),
            }
        }
    }
}

impl Supervised for PluginBridge {
    fn poll(&self) {
        self.read_log(true);
        self.check_status();
    }
}

impl Drop for PluginBridge {
    fn drop(&mut self) {
        // the watchdog can't reach us anymore, so look for ourselves
        self.check_status();
        if self.alive() {
            let mut channel = self.nrt_channel();
            if channel.add_command(&ShmCommand::Quit) && !channel.send_timeout(QUIT_TIMEOUT) {
                tracing::warn!("Host process didn't answer the quit request");
            }
        }

        let code = self.process.get_mut().wait(QUIT_TIMEOUT);
        tracing::debug!(
            "Plugin bridge {} closed (exit code {:?})",
            self.shm.path(),
            code
        );

        self.read_log(false);
        self.log.get_mut().close();
    }
}
