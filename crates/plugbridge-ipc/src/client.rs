//! Host-side façade of a plugin that runs in a bridge process.

use crate::bridge::{Channel, PluginBridge};
use crate::host_app::CpuArch;
use crate::protocol::{
    ProtocolError, ShmCommand, UiCommand, UiMessage, midi_event, read_audio, sysex_event,
};
use parking_lot::Mutex;
use plugbridge_comms::{Command, DeferredPlugin};
use plugbridge_core::{ChannelCount, Frames, SampleRate};
use plugbridge_plugin::{
    Bypass, MidiEvent, ParamDisplay, Plugin, PluginDesc, PluginError, PluginListener,
    ProcessData, ProcessMode, ProgramName, Rect, SysexEvent,
};
use plugbridge_threaded::sync::SpinLock;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Initial capacity of the outgoing command list
const COMMAND_CAPACITY: usize = 64;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

struct ClientCache {
    displays: Box<[ParamDisplay]>,
    program_names: Box<[ProgramName]>,
    program_name: ProgramName,
}

/// State the bridge updates on behalf of the client.
///
/// Registered with the bridge as the client's UI listener, so automation
/// that arrives on the UI queue lands in the caches as well.
struct ClientState {
    param_values: Box<[AtomicU32]>,
    cache: SpinLock<ClientCache>,
    program: AtomicUsize,
    latency: AtomicU32,
    transport: AtomicU64,
    listener: Mutex<Option<Arc<dyn PluginListener>>>,
}

impl ClientState {
    fn new(info: &PluginDesc) -> Self {
        let num_params = info.num_parameters();
        Self {
            param_values: (0..num_params).map(|_| AtomicU32::new(0)).collect(),
            cache: SpinLock::new(ClientCache {
                displays: vec![ParamDisplay::default(); num_params].into_boxed_slice(),
                program_names: info
                    .programs
                    .iter()
                    .map(|name| ProgramName::new(name))
                    .collect(),
                program_name: ProgramName::default(),
            }),
            program: AtomicUsize::new(0),
            latency: AtomicU32::new(0),
            transport: AtomicU64::new(0),
            listener: Mutex::new(None),
        }
    }

    fn listener(&self) -> Option<Arc<dyn PluginListener>> {
        self.listener.lock().clone()
    }

    fn set_value(&self, index: usize, value: f32) {
        if let Some(slot) = self.param_values.get(index) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    fn value(&self, index: usize) -> f32 {
        self.param_values
            .get(index)
            .map_or(0.0, |slot| f32::from_bits(slot.load(Ordering::Relaxed)))
    }

    fn update_parameter(&self, index: usize, value: f32, display: &str) {
        self.set_value(index, value);
        if let Some(slot) = self.cache.lock().displays.get_mut(index) {
            *slot = ParamDisplay::new(display);
        }
    }

    fn display(&self, index: usize) -> ParamDisplay {
        self.cache
            .lock()
            .displays
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    fn set_program_name(&self, name: &str) {
        let name = ProgramName::new(name);
        let program = self.program.load(Ordering::Relaxed);
        let mut cache = self.cache.lock();
        cache.program_name = name;
        if let Some(slot) = cache.program_names.get_mut(program) {
            *slot = name;
        }
    }

    fn handle_reply(&self, reply: ShmCommand<'_>) {
        match reply {
            ShmCommand::ParameterUpdate {
                index,
                value,
                display,
            } => self.update_parameter(index as usize, value, display),
            ShmCommand::ParamAutomated { index, value } => {
                self.parameter_automated(index as usize, value);
            }
            ShmCommand::ProgramNumber(program) => {
                self.program.store(program as usize, Ordering::Relaxed);
            }
            ShmCommand::ProgramName(name) => self.set_program_name(name),
            ShmCommand::ProgramNameIndexed { index, name } => {
                if let Some(slot) = self.cache.lock().program_names.get_mut(index as usize) {
                    *slot = ProgramName::new(name);
                }
            }
            ShmCommand::LatencyChanged(samples) => self.latency_changed(samples),
            ShmCommand::UpdateDisplay => self.update_display(),
            ShmCommand::MidiReceived {
                data,
                delta,
                detune,
            } => self.midi_event(&midi_event(data, delta, detune)),
            ShmCommand::SysexReceived { data, delta } => {
                self.sysex_event(&sysex_event(data, delta));
            }
            ShmCommand::TransportPosition(beat) => {
                self.transport.store(beat.to_bits(), Ordering::Relaxed);
            }
            ShmCommand::Error { code, message } => {
                tracing::warn!("{}", PluginError::from_code(code, message));
            }
            other => tracing::debug!("Ignoring reply {:?}", other),
        }
    }

    fn dispatch_replies(&self, channel: &Channel<'_>) {
        while let Some(reply) = channel.get_command() {
            match reply {
                Ok(reply) => self.handle_reply(reply),
                Err(e) => tracing::warn!("{}: {}", channel.name(), e),
            }
        }
    }
}

impl PluginListener for ClientState {
    fn parameter_automated(&self, index: usize, value: f32) {
        self.set_value(index, value);
        if let Some(listener) = self.listener() {
            listener.parameter_automated(index, value);
        }
    }

    fn latency_changed(&self, samples: u32) {
        self.latency.store(samples, Ordering::Relaxed);
        if let Some(listener) = self.listener() {
            listener.latency_changed(samples);
        }
    }

    fn update_display(&self) {
        if let Some(listener) = self.listener() {
            listener.update_display();
        }
    }

    fn plugin_crashed(&self) {
        if let Some(listener) = self.listener() {
            listener.plugin_crashed();
        }
    }

    fn midi_event(&self, event: &MidiEvent) {
        if let Some(listener) = self.listener() {
            listener.midi_event(event);
        }
    }

    fn sysex_event(&self, event: &SysexEvent) {
        if let Some(listener) = self.listener() {
            listener.sysex_event(event);
        }
    }
}

/// A plugin hosted by a [`PluginBridge`]
///
/// Setters are queued and sent along with the next processing block. Getters
/// read local caches that are refreshed from the replies, so they never wait
/// for the bridge.
pub struct PluginClient {
    bridge: Arc<PluginBridge>,
    id: u32,
    info: PluginDesc,
    state: Arc<ClientState>,
    commands: Vec<Command>,
    editor: Option<Rect>,
}

impl PluginClient {
    /// Load a native plugin, in its own process if `sandbox` is set and in
    /// the shared bridge otherwise
    pub fn new(path: &str, sandbox: bool) -> Result<Self, PluginError> {
        Self::with_arch(CpuArch::host(), path, sandbox)
    }

    pub fn with_arch(arch: CpuArch, path: &str, sandbox: bool) -> Result<Self, PluginError> {
        let bridge = if sandbox {
            PluginBridge::create(arch)?
        } else {
            PluginBridge::get_shared(arch)?
        };
        Self::with_bridge(bridge, path)
    }

    /// Create the plugin in an existing bridge
    pub fn with_bridge(bridge: Arc<PluginBridge>, path: &str) -> Result<Self, PluginError> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        let (info, state) = {
            let mut channel = bridge.nrt_channel();
            let request = ShmCommand::CreatePlugin { id, path };
            if !channel.add_command(&request) {
                return Err(ProtocolError::TooLarge(path.len()).into());
            }
            channel.send()?;

            let info = match channel.get_command() {
                Some(Ok(ShmCommand::PluginInfo(info))) => info,
                Some(Ok(ShmCommand::Error { code, message })) => {
                    return Err(PluginError::from_code(code, message));
                }
                Some(Ok(other)) => {
                    return Err(ProtocolError::UnexpectedReply(format!("{other:?}")).into());
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(ProtocolError::UnexpectedReply("empty reply".to_string()).into());
                }
            };
            let state = Arc::new(ClientState::new(&info));
            state.dispatch_replies(&channel);
            (info, state)
        };

        bridge.add_ui_client(id, Arc::clone(&state) as Arc<dyn PluginListener>);

        tracing::debug!(
            "Created bridged plugin {} ('{}') in {}",
            id,
            info.name,
            bridge.shm_path()
        );

        Ok(Self {
            bridge,
            id,
            info,
            state,
            commands: Vec::with_capacity(COMMAND_CAPACITY),
            editor: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn bridge(&self) -> &Arc<PluginBridge> {
        &self.bridge
    }

    /// Commands waiting for the next block
    pub fn num_pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Send a request on the non-real-time channel and process the reply
    fn request(&self, command: &ShmCommand) -> Result<(), PluginError> {
        let channel = self.nrt_request(command)?;
        self.state.dispatch_replies(&channel);
        Ok(())
    }

    /// Send a request whose reply carries a data blob
    fn request_data(&self, command: &ShmCommand) -> Result<Vec<u8>, PluginError> {
        let channel = self.nrt_request(command)?;
        match channel.get_command() {
            Some(Ok(ShmCommand::PluginData(data))) => Ok(data.to_vec()),
            Some(Ok(other)) => Err(ProtocolError::UnexpectedReply(format!("{other:?}")).into()),
            Some(Err(e)) => Err(e.into()),
            None => Err(ProtocolError::UnexpectedReply("empty reply".to_string()).into()),
        }
    }

    fn nrt_request(&self, command: &ShmCommand) -> Result<Channel<'_>, PluginError> {
        let mut channel = self.bridge.nrt_channel();
        if !channel.add_command(command) {
            let size = bincode::serialized_size(command).map_or(0, |n| n as usize);
            return Err(ProtocolError::TooLarge(size).into());
        }
        channel.send()?;
        channel.check_error()?;
        Ok(channel)
    }

    fn post_ui(&self, command: UiCommand) {
        self.bridge.post_ui_thread(&UiMessage {
            id: self.id,
            command,
        });
    }
}

impl DeferredPlugin for PluginClient {
    fn push_command(&mut self, command: Command) {
        self.commands.push(command);
    }
}

impl Drop for PluginClient {
    fn drop(&mut self) {
        self.bridge.remove_ui_client(self.id);
        if self.bridge.alive() {
            if let Err(e) = self.request(&ShmCommand::DestroyPlugin { id: self.id }) {
                tracing::warn!("Couldn't destroy plugin {}: {}", self.id, e);
            }
        }
        tracing::debug!("Destroyed bridged plugin {} ('{}')", self.id, self.info.name);
    }
}

impl Plugin for PluginClient {
    fn info(&self) -> &PluginDesc {
        &self.info
    }

    fn is_bridged(&self) -> bool {
        true
    }

    fn setup_processing(
        &mut self,
        sample_rate: SampleRate,
        max_block_size: Frames,
        mode: ProcessMode,
    ) -> Result<(), PluginError> {
        self.request(&ShmCommand::SetupProcessing {
            id: self.id,
            sample_rate,
            max_block_size: max_block_size as u32,
            mode: mode.as_u8(),
        })
    }

    fn process(&mut self, data: &mut ProcessData) {
        if !self.bridge.alive() {
            self.commands.clear();
            data.clear_outputs();
            return;
        }

        let n = data.num_samples;
        let (num_inputs, num_outputs) = (self.info.num_inputs, self.info.num_outputs);

        let mut channel = self.bridge.rt_channel();
        let header = ShmCommand::Process {
            id: self.id,
            num_samples: n as u32,
            num_inputs: num_inputs as u32,
            num_outputs: num_outputs as u32,
        };
        // a missing input goes out empty and arrives as silence
        let complete = channel.add_command(&header)
            && (0..num_inputs).all(|ch| {
                let input = data.inputs.get(ch).map_or(&[][..], |s| &s[..n.min(s.len())]);
                channel.add_audio(input)
            });
        if !complete {
            data.clear_outputs();
            return;
        }

        // whatever doesn't fit goes with the next block
        let mut sent = 0;
        while let Some(command) = self.commands.get(sent) {
            if channel.add_command(&ShmCommand::from(command)) {
                sent += 1;
            } else if sent > 0 {
                break;
            } else {
                // doesn't fit next to the audio of a block, so it never will
                let command = self.commands.remove(0);
                tracing::warn!(
                    "{}: dropping {:?} command, too large for channel {}",
                    self.info.name,
                    command.kind(),
                    channel.name()
                );
            }
        }
        self.commands.drain(..sent);

        if channel.send().is_err() {
            data.clear_outputs();
            return;
        }

        for ch in 0..num_outputs {
            let reply = channel.get_reply();
            if let Some(output) = data.outputs.get_mut(ch) {
                let len = n.min(output.len());
                match reply {
                    Some(bytes) => {
                        read_audio(bytes, &mut output[..len]);
                    }
                    None => output[..len].fill(0.0),
                }
            }
        }
        for output in data.outputs.iter_mut().skip(num_outputs) {
            let len = n.min(output.len());
            output[..len].fill(0.0);
        }

        self.state.dispatch_replies(&channel);
    }

    fn suspend(&mut self) {
        if let Err(e) = self.request(&ShmCommand::Suspend { id: self.id }) {
            tracing::error!("{}: suspend failed: {}", self.info.name, e);
        }
    }

    fn resume(&mut self) {
        if let Err(e) = self.request(&ShmCommand::Resume { id: self.id }) {
            tracing::error!("{}: resume failed: {}", self.info.name, e);
        }
    }

    fn set_num_speakers(
        &mut self,
        inputs: ChannelCount,
        outputs: ChannelCount,
    ) -> Result<(), PluginError> {
        self.request(&ShmCommand::SetNumSpeakers {
            id: self.id,
            inputs: inputs as u32,
            outputs: outputs as u32,
        })?;
        self.info.num_inputs = inputs;
        self.info.num_outputs = outputs;
        Ok(())
    }

    fn latency_samples(&self) -> u32 {
        self.state.latency.load(Ordering::Relaxed)
    }

    fn set_listener(&mut self, listener: Option<Arc<dyn PluginListener>>) {
        *self.state.listener.lock() = listener;
    }

    fn transport_position(&self) -> f64 {
        f64::from_bits(self.state.transport.load(Ordering::Relaxed))
    }

    fn set_parameter(&mut self, index: usize, value: f32, sample_offset: u32) {
        DeferredPlugin::set_parameter(self, index, value, sample_offset);
    }

    fn set_parameter_string(&mut self, index: usize, value: &str, sample_offset: u32) -> bool {
        DeferredPlugin::set_parameter_string(self, index, value, sample_offset)
    }

    fn parameter(&self, index: usize) -> f32 {
        self.state.value(index)
    }

    fn parameter_string(&self, index: usize) -> ParamDisplay {
        self.state.display(index)
    }

    fn set_bypass(&mut self, state: Bypass) {
        DeferredPlugin::set_bypass(self, state);
    }

    fn set_program(&mut self, program: usize) {
        self.state.program.store(program, Ordering::Relaxed);
        DeferredPlugin::set_program(self, program);
    }

    fn program(&self) -> usize {
        self.state.program.load(Ordering::Relaxed)
    }

    fn set_program_name(&mut self, name: &str) {
        DeferredPlugin::set_program_name(self, name);
    }

    fn program_name(&self) -> String {
        self.state.cache.lock().program_name.to_string()
    }

    fn program_name_indexed(&self, index: usize) -> String {
        self.state
            .cache
            .lock()
            .program_names
            .get(index)
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    fn read_program_file(&mut self, path: &Path) -> Result<(), PluginError> {
        self.request(&ShmCommand::ReadProgramFile {
            id: self.id,
            path: &path.to_string_lossy(),
        })
    }

    fn read_program_data(&mut self, data: &[u8]) -> Result<(), PluginError> {
        self.request(&ShmCommand::ReadProgramData { id: self.id, data })
    }

    fn write_program_file(&mut self, path: &Path) -> Result<(), PluginError> {
        self.request(&ShmCommand::WriteProgramFile {
            id: self.id,
            path: &path.to_string_lossy(),
        })
    }

    fn write_program_data(&mut self) -> Result<Vec<u8>, PluginError> {
        self.request_data(&ShmCommand::WriteProgramData { id: self.id })
    }

    fn read_bank_file(&mut self, path: &Path) -> Result<(), PluginError> {
        self.request(&ShmCommand::ReadBankFile {
            id: self.id,
            path: &path.to_string_lossy(),
        })
    }

    fn read_bank_data(&mut self, data: &[u8]) -> Result<(), PluginError> {
        self.request(&ShmCommand::ReadBankData { id: self.id, data })
    }

    fn write_bank_file(&mut self, path: &Path) -> Result<(), PluginError> {
        self.request(&ShmCommand::WriteBankFile {
            id: self.id,
            path: &path.to_string_lossy(),
        })
    }

    fn write_bank_data(&mut self) -> Result<Vec<u8>, PluginError> {
        self.request_data(&ShmCommand::WriteBankData { id: self.id })
    }

    fn open_editor(&mut self) {
        self.editor.get_or_insert_with(Rect::default);
        self.post_ui(UiCommand::WindowOpen);
    }

    fn close_editor(&mut self) {
        self.editor = None;
        self.post_ui(UiCommand::WindowClose);
    }

    fn editor_rect(&self) -> Option<Rect> {
        self.editor
    }

    fn set_editor_pos(&mut self, x: i32, y: i32) {
        if let Some(rect) = &mut self.editor {
            rect.x = x;
            rect.y = y;
        }
        self.post_ui(UiCommand::WindowSetPos { x, y });
    }

    fn resize_editor(&mut self, width: i32, height: i32) {
        if let Some(rect) = &mut self.editor {
            rect.width = width;
            rect.height = height;
        }
        self.post_ui(UiCommand::WindowSetSize { width, height });
    }

    fn send_midi_event(&mut self, event: &MidiEvent) {
        DeferredPlugin::send_midi_event(self, event);
    }

    fn send_sysex_event(&mut self, event: &SysexEvent) {
        DeferredPlugin::send_sysex_event(self, event);
    }

    fn set_tempo_bpm(&mut self, tempo: f64) {
        DeferredPlugin::set_tempo_bpm(self, tempo);
    }

    fn set_time_signature(&mut self, numerator: i32, denominator: i32) {
        DeferredPlugin::set_time_signature(self, numerator, denominator);
    }

    fn set_transport_playing(&mut self, play: bool) {
        DeferredPlugin::set_transport_playing(self, play);
    }

    fn set_transport_recording(&mut self, record: bool) {
        DeferredPlugin::set_transport_recording(self, record);
    }

    fn set_transport_automation_writing(&mut self, writing: bool) {
        DeferredPlugin::set_transport_automation_writing(self, writing);
    }

    fn set_transport_automation_reading(&mut self, reading: bool) {
        DeferredPlugin::set_transport_automation_reading(self, reading);
    }

    fn set_transport_cycle_active(&mut self, active: bool) {
        DeferredPlugin::set_transport_cycle_active(self, active);
    }

    fn set_transport_cycle_start(&mut self, beat: f64) {
        DeferredPlugin::set_transport_cycle_start(self, beat);
    }

    fn set_transport_cycle_end(&mut self, beat: f64) {
        DeferredPlugin::set_transport_cycle_end(self, beat);
    }

    fn set_transport_position(&mut self, beat: f64) {
        DeferredPlugin::set_transport_position(self, beat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugbridge_plugin::ParameterInfo;

    fn desc() -> PluginDesc {
        PluginDesc {
            name: "Test".to_string(),
            parameters: vec![
                ParameterInfo {
                    name: "Gain".to_string(),
                    label: "dB".to_string(),
                },
                ParameterInfo {
                    name: "Pan".to_string(),
                    label: String::new(),
                },
            ],
            programs: vec!["Init".to_string(), "Loud".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_parameter_cache_is_bit_exact() {
        let state = ClientState::new(&desc());
        let value = f32::from_bits(0x3eaa_aaab);
        state.handle_reply(ShmCommand::ParameterUpdate {
            index: 1,
            value,
            display: "a display longer than fifteen bytes",
        });
        assert_eq!(state.value(1).to_bits(), value.to_bits());
        assert_eq!(state.display(1).as_str(), "a display longe");

        // out of range indices are ignored
        state.update_parameter(7, 1.0, "x");
        assert_eq!(state.value(7), 0.0);
        assert!(state.display(7).is_empty());
    }

    #[test]
    fn test_program_replies() {
        let state = ClientState::new(&desc());
        state.handle_reply(ShmCommand::ProgramNumber(1));
        state.handle_reply(ShmCommand::ProgramName("Louder"));
        state.handle_reply(ShmCommand::ProgramNameIndexed {
            index: 0,
            name: "First",
        });

        assert_eq!(state.program.load(Ordering::Relaxed), 1);
        let cache = state.cache.lock();
        assert_eq!(cache.program_name.as_str(), "Louder");
        assert_eq!(cache.program_names[0].as_str(), "First");
        assert_eq!(cache.program_names[1].as_str(), "Louder");
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl PluginListener for Recorder {
        fn parameter_automated(&self, index: usize, value: f32) {
            self.0.lock().push(format!("param {index} {value}"));
        }

        fn latency_changed(&self, samples: u32) {
            self.0.lock().push(format!("latency {samples}"));
        }

        fn midi_event(&self, event: &MidiEvent) {
            self.0.lock().push(format!("midi {:?}", event.data));
        }
    }

    #[test]
    fn test_events_reach_the_listener() {
        let state = ClientState::new(&desc());
        state.handle_reply(ShmCommand::ParamAutomated {
            index: 0,
            value: 0.5,
        });
        assert_eq!(state.value(0), 0.5);

        let recorder = Arc::new(Recorder::default());
        *state.listener.lock() = Some(Arc::clone(&recorder) as Arc<dyn PluginListener>);
        state.handle_reply(ShmCommand::ParamAutomated {
            index: 1,
            value: 0.25,
        });
        state.handle_reply(ShmCommand::LatencyChanged(64));
        state.handle_reply(ShmCommand::MidiReceived {
            data: [0x90, 60, 100],
            delta: 0,
            detune: 0.0,
        });
        state.handle_reply(ShmCommand::TransportPosition(4.5));

        assert_eq!(
            *recorder.0.lock(),
            vec!["param 1 0.25", "latency 64", "midi [144, 60, 100]"]
        );
        assert_eq!(state.latency.load(Ordering::Relaxed), 64);
        assert_eq!(f64::from_bits(state.transport.load(Ordering::Relaxed)), 4.5);
    }
}
