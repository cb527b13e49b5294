//! Server side of a bridge, running inside the host process.
//!
//! One thread per request channel waits for requests and answers them; the
//! main loop polls the UI queue, forwards automation that happened outside
//! of processing and watches the parent process.

use crate::bridge::{FIRST_REQUEST_CHANNEL, UI_RECEIVE_CHANNEL, UI_SEND_CHANNEL};
use crate::channel::ShmChannel;
use crate::interface::ShmInterface;
use crate::protocol::{
    ProtocolError, ShmCommand, UiCommand, UiMessage, add_audio, add_command, decode, decode_ui,
    encode_ui, read_audio,
};
use parking_lot::{Mutex, RwLock};
use plugbridge_comms::{Command, apply_command};
use plugbridge_core::{ChannelCount, Sample};
use plugbridge_plugin::{
    MidiEvent, Plugin, PluginDesc, PluginError, PluginEvent, PluginListener, ProcessData,
    ProcessMode, SysexEvent, builtin,
};
use smallvec::SmallVec;
use std::cell::Cell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the main loop polls the UI queue and the parent
const UI_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Automation messages kept while the UI queue is full
const MAX_PENDING_UI_MESSAGES: usize = 64;

thread_local! {
    static IN_PROCESS: Cell<bool> = const { Cell::new(false) };
}

/// Creates plugins from the path sent by the client
pub trait PluginLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<Box<dyn Plugin>, PluginError>;
}

/// Loads the plugins built into this crate (`builtin:<name>`)
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinLoader;

impl PluginLoader for BuiltinLoader {
    fn load(&self, path: &str) -> Result<Box<dyn Plugin>, PluginError> {
        builtin::load_path(path)
            .ok_or_else(|| PluginError::InitializationFailed(format!("Unknown plugin '{path}'")))
    }
}

/// Collects what a plugin reports.
///
/// Events raised while processing go into the reply of the current block;
/// everything else is sent over the UI queue.
struct HandleListener {
    id: u32,
    events: Mutex<Vec<PluginEvent>>,
    ui_queue: Arc<Mutex<Vec<UiMessage>>>,
}

impl HandleListener {
    fn report(&self, event: PluginEvent, command: Option<UiCommand>) {
        if IN_PROCESS.with(Cell::get) {
            self.events.lock().push(event);
        } else if let Some(command) = command {
            let mut queue = self.ui_queue.lock();
            if queue.len() < MAX_PENDING_UI_MESSAGES {
                queue.push(UiMessage {
                    id: self.id,
                    command,
                });
            }
        }
    }
}

impl PluginListener for HandleListener {
    fn parameter_automated(&self, index: usize, value: f32) {
        self.report(
            PluginEvent::ParameterAutomated { index, value },
            Some(UiCommand::ParamAutomated {
                index: index as u32,
                value,
            }),
        );
    }

    fn latency_changed(&self, samples: u32) {
        self.report(
            PluginEvent::LatencyChanged(samples),
            Some(UiCommand::LatencyChanged(samples)),
        );
    }

    fn update_display(&self) {
        self.report(PluginEvent::UpdateDisplay, Some(UiCommand::UpdateDisplay));
    }

    fn midi_event(&self, event: &MidiEvent) {
        self.report(PluginEvent::Midi(*event), None);
    }

    fn sysex_event(&self, event: &SysexEvent) {
        self.report(PluginEvent::Sysex(event.clone()), None);
    }
}

/// Write a reply frame, logging when the channel is full
fn reply(channel: &ShmChannel, command: &ShmCommand) -> bool {
    let added = add_command(channel, command);
    if !added {
        tracing::warn!("{}: reply doesn't fit, dropping the rest", channel.name());
    }
    added
}

/// One hosted plugin plus its audio buffers
struct PluginHandle {
    id: u32,
    plugin: Box<dyn Plugin>,
    listener: Arc<HandleListener>,
    inputs: Vec<Vec<Sample>>,
    outputs: Vec<Vec<Sample>>,
    max_block_size: usize,
    touched: Vec<usize>,
    events: Vec<PluginEvent>,
}

impl PluginHandle {
    fn new(id: u32, mut plugin: Box<dyn Plugin>, ui_queue: Arc<Mutex<Vec<UiMessage>>>) -> Self {
        let listener = Arc::new(HandleListener {
            id,
            events: Mutex::new(Vec::new()),
            ui_queue,
        });
        plugin.set_listener(Some(Arc::clone(&listener) as Arc<dyn PluginListener>));

        let info = plugin.info();
        let (num_inputs, num_outputs) = (info.num_inputs, info.num_outputs);
        let mut handle = Self {
            id,
            plugin,
            listener,
            inputs: Vec::new(),
            outputs: Vec::new(),
            max_block_size: 0,
            touched: Vec::new(),
            events: Vec::new(),
        };
        handle.resize_buffers(num_inputs, num_outputs, 0);
        handle
    }

    fn info(&self) -> &PluginDesc {
        self.plugin.info()
    }

    fn resize_buffers(&mut self, inputs: ChannelCount, outputs: ChannelCount, block_size: usize) {
        self.max_block_size = block_size;
        self.inputs.resize_with(inputs, Vec::new);
        self.outputs.resize_with(outputs, Vec::new);
        for buffer in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            buffer.resize(block_size, 0.0);
        }
    }

    /// Description, program and parameter state right after creation
    fn send_info(&self, channel: &ShmChannel) {
        if !reply(channel, &ShmCommand::PluginInfo(self.info().clone())) {
            return;
        }
        for index in 0..self.info().num_programs() {
            let name = self.plugin.program_name_indexed(index);
            if !reply(
                channel,
                &ShmCommand::ProgramNameIndexed {
                    index: index as u32,
                    name: &name,
                },
            ) {
                return;
            }
        }
        if reply(
            channel,
            &ShmCommand::LatencyChanged(self.plugin.latency_samples()),
        ) {
            self.send_program_update(channel);
        }
    }

    /// Current program and the value of every parameter
    fn send_program_update(&self, channel: &ShmChannel) -> bool {
        let name = self.plugin.program_name();
        if !reply(channel, &ShmCommand::ProgramNumber(self.plugin.program() as u32))
            || !reply(channel, &ShmCommand::ProgramName(&name))
        {
            return false;
        }
        (0..self.info().num_parameters()).all(|index| self.send_parameter(channel, index))
    }

    fn send_parameter(&self, channel: &ShmChannel, index: usize) -> bool {
        let display = self.plugin.parameter_string(index);
        reply(
            channel,
            &ShmCommand::ParameterUpdate {
                index: index as u32,
                value: self.plugin.parameter(index),
                display: display.as_str(),
            },
        )
    }

    fn handle_request(
        &mut self,
        command: &ShmCommand<'_>,
        channel: &ShmChannel,
    ) -> Result<(), PluginError> {
        match *command {
            ShmCommand::Suspend { .. } => {
                channel.clear();
                self.plugin.suspend();
            }
            ShmCommand::Resume { .. } => {
                channel.clear();
                self.plugin.resume();
            }
            ShmCommand::SetupProcessing {
                sample_rate,
                max_block_size,
                mode,
                ..
            } => {
                channel.clear();
                self.plugin.setup_processing(
                    sample_rate,
                    max_block_size as usize,
                    ProcessMode::from_u8(mode),
                )?;
                let (inputs, outputs) = (self.inputs.len(), self.outputs.len());
                self.resize_buffers(inputs, outputs, max_block_size as usize);
            }
            ShmCommand::SetNumSpeakers {
                inputs, outputs, ..
            } => {
                channel.clear();
                self.plugin
                    .set_num_speakers(inputs as usize, outputs as usize)?;
                self.resize_buffers(inputs as usize, outputs as usize, self.max_block_size);
            }
            ShmCommand::ReadProgramFile { path, .. } => {
                let path = Path::new(path).to_path_buf();
                channel.clear();
                self.plugin.read_program_file(&path)?;
                self.send_program_update(channel);
            }
            ShmCommand::ReadProgramData { data, .. } => {
                let result = self.plugin.read_program_data(data);
                channel.clear();
                result?;
                self.send_program_update(channel);
            }
            ShmCommand::ReadBankFile { path, .. } => {
                let path = Path::new(path).to_path_buf();
                channel.clear();
                self.plugin.read_bank_file(&path)?;
                self.send_program_update(channel);
            }
            ShmCommand::ReadBankData { data, .. } => {
                let result = self.plugin.read_bank_data(data);
                channel.clear();
                result?;
                self.send_program_update(channel);
            }
            ShmCommand::WriteProgramFile { path, .. } => {
                let path = Path::new(path).to_path_buf();
                channel.clear();
                self.plugin.write_program_file(&path)?;
            }
            ShmCommand::WriteBankFile { path, .. } => {
                let path = Path::new(path).to_path_buf();
                channel.clear();
                self.plugin.write_bank_file(&path)?;
            }
            ShmCommand::WriteProgramData { .. } => {
                channel.clear();
                let data = self.plugin.write_program_data()?;
                Self::send_data(channel, &data)?;
            }
            ShmCommand::WriteBankData { .. } => {
                channel.clear();
                let data = self.plugin.write_bank_data()?;
                Self::send_data(channel, &data)?;
            }
            ShmCommand::Process {
                num_samples,
                num_inputs,
                num_outputs,
                ..
            } => self.process(
                channel,
                num_samples as usize,
                num_inputs as usize,
                num_outputs as usize,
            ),
            ref other => {
                let err = ProtocolError::UnexpectedReply(format!("unexpected request {other:?}"));
                channel.clear();
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn send_data(channel: &ShmChannel, data: &[u8]) -> Result<(), PluginError> {
        if add_command(channel, &ShmCommand::PluginData(data)) {
            Ok(())
        } else {
            Err(ProtocolError::TooLarge(data.len()).into())
        }
    }

    /// Run one block: read input audio and commands, process, then write
    /// output audio and everything the host has to know about.
    fn process(
        &mut self,
        channel: &ShmChannel,
        num_samples: usize,
        num_inputs: usize,
        num_outputs: usize,
    ) {
        if num_samples > self.max_block_size
            || num_inputs != self.inputs.len()
            || num_outputs != self.outputs.len()
        {
            tracing::warn!(
                "{}: block of {} samples ({} in, {} out) doesn't match the setup, reallocating",
                self.info().name,
                num_samples,
                num_inputs,
                num_outputs
            );
            let block_size = num_samples.max(self.max_block_size);
            self.resize_buffers(num_inputs, num_outputs, block_size);
        }

        for input in &mut self.inputs {
            match channel.get_message() {
                Some(bytes) => {
                    read_audio(bytes, &mut input[..num_samples]);
                }
                None => input[..num_samples].fill(0.0),
            }
        }

        self.touched.clear();
        let mut program_changed = false;
        let mut name_changed = false;
        while let Some(bytes) = channel.get_message() {
            let command = match decode(bytes) {
                Ok(shm) => shm.to_command(),
                Err(e) => {
                    tracing::warn!("{}: {}", self.info().name, e);
                    None
                }
            };
            match &command {
                Some(
                    Command::SetParamValue { index, .. } | Command::SetParamString { index, .. },
                ) => self.touched.push(*index),
                Some(Command::SetProgram(_)) => program_changed = true,
                Some(Command::SetProgramName(_)) => name_changed = true,
                _ => {}
            }
            if let Some(command) = command {
                apply_command(self.plugin.as_mut(), command);
            }
        }

        {
            let inputs: SmallVec<[&[Sample]; 16]> =
                self.inputs.iter().map(|v| &v[..num_samples]).collect();
            let mut outputs: SmallVec<[&mut [Sample]; 16]> = self
                .outputs
                .iter_mut()
                .map(|v| &mut v[..num_samples])
                .collect();
            let mut data = ProcessData {
                inputs: &inputs,
                outputs: &mut outputs,
                num_samples,
            };
            IN_PROCESS.with(|flag| flag.set(true));
            self.plugin.process(&mut data);
            IN_PROCESS.with(|flag| flag.set(false));
        }

        // the request has been consumed, the reply goes into the same buffer
        channel.clear();

        for output in &self.outputs {
            if !add_audio(channel, &output[..num_samples]) {
                tracing::warn!("{}: output audio doesn't fit", channel.name());
                return;
            }
        }

        self.events.clear();
        std::mem::swap(&mut self.events, &mut *self.listener.events.lock());

        let ok = self.send_replies(channel, program_changed, name_changed);
        if ok {
            reply(
                channel,
                &ShmCommand::TransportPosition(self.plugin.transport_position()),
            );
        }
    }

    fn send_replies(&mut self, channel: &ShmChannel, program_changed: bool, name_changed: bool) -> bool {
        if program_changed {
            if !self.send_program_update(channel) {
                return false;
            }
        } else {
            if name_changed {
                let name = self.plugin.program_name();
                if !reply(channel, &ShmCommand::ProgramName(&name)) {
                    return false;
                }
            }
            self.touched.sort_unstable();
            self.touched.dedup();
            for &index in &self.touched {
                if !self.send_parameter(channel, index) {
                    return false;
                }
            }
        }

        for event in &self.events {
            let ok = match event {
                PluginEvent::ParameterAutomated { index, value } => reply(
                    channel,
                    &ShmCommand::ParamAutomated {
                        index: *index as u32,
                        value: *value,
                    },
                ),
                PluginEvent::LatencyChanged(samples) => {
                    reply(channel, &ShmCommand::LatencyChanged(*samples))
                }
                PluginEvent::UpdateDisplay => reply(channel, &ShmCommand::UpdateDisplay),
                PluginEvent::Midi(event) => reply(
                    channel,
                    &ShmCommand::MidiReceived {
                        data: event.data,
                        delta: event.delta,
                        detune: event.detune,
                    },
                ),
                PluginEvent::Sysex(event) => reply(
                    channel,
                    &ShmCommand::SysexReceived {
                        data: &event.data,
                        delta: event.delta,
                    },
                ),
                PluginEvent::Crashed => true,
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn handle_ui(&mut self, command: UiCommand) {
        match command {
            UiCommand::WindowOpen => self.plugin.open_editor(),
            UiCommand::WindowClose => self.plugin.close_editor(),
            UiCommand::WindowSetPos { x, y } => self.plugin.set_editor_pos(x, y),
            UiCommand::WindowSetSize { width, height } => self.plugin.resize_editor(width, height),
            other => tracing::debug!("plugin {}: ignoring UI command {:?}", self.id, other),
        }
    }
}

/// Serves all plugins of one bridge
pub struct PluginServer {
    shm: ShmInterface,
    parent: Option<u32>,
    running: AtomicBool,
    loader: Arc<dyn PluginLoader>,
    plugins: RwLock<HashMap<u32, Arc<Mutex<PluginHandle>>>>,
    ui_queue: Arc<Mutex<Vec<UiMessage>>>,
}

impl PluginServer {
    /// Connect to the bridge's shared memory.
    ///
    /// `parent` is the process id of the bridge owner; the server quits when
    /// it goes away.
    pub fn connect(
        shm_path: &str,
        parent: Option<u32>,
        loader: Arc<dyn PluginLoader>,
    ) -> Result<Arc<Self>, PluginError> {
        let shm = ShmInterface::connect(shm_path)?;
        if shm.num_channels() <= FIRST_REQUEST_CHANNEL {
            return Err(PluginError::SystemError(format!(
                "{shm_path} has only {} channels",
                shm.num_channels()
            )));
        }
        tracing::debug!(
            "Plugin server connected to {} ({} request channels)",
            shm_path,
            shm.num_channels() - FIRST_REQUEST_CHANNEL
        );
        Ok(Arc::new(Self {
            shm,
            parent,
            running: AtomicBool::new(true),
            loader,
            plugins: RwLock::new(HashMap::new()),
            ui_queue: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn num_plugins(&self) -> usize {
        self.plugins.read().len()
    }

    /// Serve requests until the bridge sends `Quit` or the parent dies
    pub fn run(self: Arc<Self>) {
        let threads: Vec<JoinHandle<()>> = (FIRST_REQUEST_CHANNEL..self.shm.num_channels())
            .filter_map(|index| {
                let server = Arc::clone(&self);
                std::thread::Builder::new()
                    .name(format!("server-{}", self.shm.channel(index).name()))
                    .spawn(move || server.serve(index))
                    .map_err(|e| tracing::error!("Failed to spawn server thread: {}", e))
                    .ok()
            })
            .collect();

        let mut buffer = Vec::new();
        while self.is_running() {
            self.poll_ui(&mut buffer);
            self.flush_ui_queue();

            if let Some(parent) = self.parent {
                if !process_alive(parent) {
                    tracing::warn!("Parent process {} is gone, quitting", parent);
                    self.shm.set_orphaned();
                    self.running.store(false, Ordering::Release);
                    break;
                }
            }
            std::thread::sleep(UI_POLL_INTERVAL);
        }

        // wake up the request threads so they see we're done
        for channel in &self.shm.channels()[FIRST_REQUEST_CHANNEL..] {
            channel.post();
        }
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("Server thread panicked");
            }
        }
        self.plugins.write().clear();
        tracing::debug!("Plugin server stopped");
    }

    fn serve(&self, index: usize) {
        let channel = self.shm.channel(index);
        loop {
            channel.wait();
            if !self.is_running() {
                break;
            }
            self.handle_request(channel);
            channel.post_reply();
        }
    }

    fn handle_request(&self, channel: &ShmChannel) {
        channel.reset();
        let Some(bytes) = channel.get_message() else {
            channel.clear();
            return;
        };
        let command = match decode(bytes) {
            Ok(command) => command,
            Err(e) => {
                channel.clear();
                let err = PluginError::from(e);
                add_command(channel, &ShmCommand::error(&err));
                return;
            }
        };

        let result = match command {
            ShmCommand::CreatePlugin { id, path } => {
                let path = path.to_string();
                channel.clear();
                self.create_plugin(channel, id, &path)
            }
            ShmCommand::DestroyPlugin { id } => {
                channel.clear();
                if self.plugins.write().remove(&id).is_some() {
                    tracing::debug!("Destroyed plugin {}", id);
                }
                Ok(())
            }
            ShmCommand::Quit => {
                channel.clear();
                tracing::debug!("Received quit request");
                self.running.store(false, Ordering::Release);
                Ok(())
            }
            ref other => match other.plugin_id().and_then(|id| self.find(id)) {
                Some(handle) => {
                    let mut guard = handle.lock();
                    guard.handle_request(other, channel)
                }
                None => {
                    let err =
                        PluginError::InvalidParameter(format!("no plugin for request {other:?}"));
                    channel.clear();
                    Err(err)
                }
            },
        };

        if let Err(e) = result {
            channel.clear();
            add_command(channel, &ShmCommand::error(&e));
        }
    }

    fn create_plugin(&self, channel: &ShmChannel, id: u32, path: &str) -> Result<(), PluginError> {
        let plugin = self.loader.load(path)?;
        let handle = PluginHandle::new(id, plugin, Arc::clone(&self.ui_queue));
        tracing::debug!("Created plugin {} ({}) from {}", id, handle.info().name, path);
        handle.send_info(channel);
        self.plugins
            .write()
            .insert(id, Arc::new(Mutex::new(handle)));
        Ok(())
    }

    fn find(&self, id: u32) -> Option<Arc<Mutex<PluginHandle>>> {
        self.plugins.read().get(&id).cloned()
    }

    /// Window requests from the host
    fn poll_ui(&self, buffer: &mut Vec<u8>) {
        let channel = self.shm.channel(UI_SEND_CHANNEL);
        while channel.read_message(buffer) {
            match decode_ui(buffer) {
                Ok(message) => match self.find(message.id) {
                    Some(handle) => {
                        let mut guard = handle.lock();
                        guard.handle_ui(message.command);
                    }
                    None => tracing::debug!("UI message for unknown plugin {}", message.id),
                },
                Err(e) => tracing::warn!("Bad UI message: {}", e),
            }
        }
    }

    fn flush_ui_queue(&self) {
        let messages = std::mem::take(&mut *self.ui_queue.lock());
        let channel = self.shm.channel(UI_RECEIVE_CHANNEL);
        for message in &messages {
            let sent = encode_ui(message).is_ok_and(|bytes| channel.write_message(&bytes));
            if !sent {
                tracing::warn!("UI queue is full, dropping {:?}", message);
            }
        }
    }
}

#[allow(unsafe_code)]
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
