//! Plugin wrapper that processes on a DSP worker thread.

use crate::double_buffer::DoubleBuffer;
use crate::pool::{DspThreadPool, PoolTask, is_dsp_thread};
use crate::sync::SyncEvent;
use parking_lot::Mutex;
use plugbridge_comms::{Command, DeferredPlugin, apply_command};
use plugbridge_core::{ChannelCount, Frames, Sample, SampleRate};
use plugbridge_plugin::{
    Bypass, MidiEvent, ParamDisplay, Plugin, PluginDesc, PluginError, PluginEvent,
    PluginListener, ProcessData, ProcessMode, Rect, SysexEvent,
};
use smallvec::SmallVec;
use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;

/// Initial capacity of the command and event buffers
const QUEUE_CAPACITY: usize = 256;

/// Receives the wrapped plugin's callbacks.
///
/// Callbacks made while a block is processed (on a DSP worker, or inline on
/// the caller when the pool is saturated) are buffered and delivered by the
/// thread that called `process()` once the block is finished and the plugin
/// is unlocked. Callbacks from anywhere else go straight to the host's
/// listener.
struct EventForwarder {
    events: DoubleBuffer<PluginEvent>,
    listener: Mutex<Option<Arc<dyn PluginListener>>>,
}

thread_local! {
    /// Set while this thread is inside `process_block`
    static IN_BLOCK: Cell<bool> = const { Cell::new(false) };
}

impl EventForwarder {
    fn post(&self, event: PluginEvent) {
        if is_dsp_thread() || IN_BLOCK.with(Cell::get) {
            self.events.push(event);
        } else {
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                event.dispatch(listener.as_ref());
            }
        }
    }

    /// Deliver buffered events, outside of any lock
    fn flush(&self, scratch: &mut Vec<PluginEvent>) {
        self.events.swap(scratch);
        if scratch.is_empty() {
            return;
        }
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                for event in scratch.drain(..) {
                    event.dispatch(listener.as_ref());
                }
            }
            None => scratch.clear(),
        }
    }
}

impl PluginListener for EventForwarder {
    fn parameter_automated(&self, index: usize, value: f32) {
        self.post(PluginEvent::ParameterAutomated { index, value });
    }

    fn latency_changed(&self, samples: u32) {
        self.post(PluginEvent::LatencyChanged(samples));
    }

    fn update_display(&self) {
        self.post(PluginEvent::UpdateDisplay);
    }

    fn plugin_crashed(&self) {
        tracing::error!("Threaded plugin reported a crash");
        self.post(PluginEvent::Crashed);
    }

    fn midi_event(&self, event: &MidiEvent) {
        self.post(PluginEvent::Midi(*event));
    }

    fn sysex_event(&self, event: &SysexEvent) {
        self.post(PluginEvent::Sysex(event.clone()));
    }
}

/// Everything the worker touches while processing
struct WorkerState {
    plugin: Box<dyn Plugin>,
    inputs: Vec<Vec<Sample>>,
    outputs: Vec<Vec<Sample>>,
    num_samples: Frames,
    max_block_size: Frames,
    pending: Vec<Command>,
}

impl WorkerState {
    fn resize_buffers(&mut self, num_inputs: ChannelCount, num_outputs: ChannelCount) {
        let size = self.max_block_size;
        self.inputs.resize_with(num_inputs, Vec::new);
        self.outputs.resize_with(num_outputs, Vec::new);
        for buffer in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            buffer.resize(size, 0.0);
        }
    }
}

struct Shared {
    state: Mutex<WorkerState>,
    commands: DoubleBuffer<Command>,
    done: SyncEvent,
}

impl Shared {
    /// Apply queued commands, then process the prepared block
    fn process_block(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let outer = IN_BLOCK.with(|flag| flag.replace(true));

        self.commands.swap(&mut state.pending);
        for command in state.pending.drain(..) {
            apply_command(state.plugin.as_mut(), command);
        }

        let n = state.num_samples;
        let inputs: SmallVec<[&[f32]; 8]> = state.inputs.iter().map(|b| &b[..n]).collect();
        let mut outputs: SmallVec<[&mut [f32]; 8]> =
            state.outputs.iter_mut().map(|b| &mut b[..n]).collect();
        let mut data = ProcessData {
            inputs: &inputs,
            outputs: &mut outputs,
            num_samples: n,
        };
        state.plugin.process(&mut data);
        IN_BLOCK.with(|flag| flag.set(outer));
    }
}

impl PoolTask for Shared {
    fn run(&self) {
        self.process_block();
        self.done.set();
    }
}

/// A plugin that runs its processing on the DSP thread pool
///
/// Setters are deferred and applied in order right before the next block.
/// `process()` hands the block to a worker and returns when it is done, so
/// several threaded plugins called from different host threads process in
/// parallel.
pub struct ThreadedPlugin {
    shared: Arc<Shared>,
    forwarder: Arc<EventForwarder>,
    pool: Arc<DspThreadPool>,
    info: PluginDesc,
    program: usize,
    event_scratch: Vec<PluginEvent>,
}

impl ThreadedPlugin {
    /// Wrap a plugin, using the process-wide DSP thread pool
    pub fn new(plugin: Box<dyn Plugin>) -> Self {
        Self::with_pool(plugin, Arc::clone(DspThreadPool::instance()))
    }

    /// Wrap a plugin, using a specific pool
    pub fn with_pool(mut plugin: Box<dyn Plugin>, pool: Arc<DspThreadPool>) -> Self {
        let forwarder = Arc::new(EventForwarder {
            events: DoubleBuffer::with_capacity(QUEUE_CAPACITY),
            listener: Mutex::new(None),
        });
        plugin.set_listener(Some(Arc::clone(&forwarder) as Arc<dyn PluginListener>));

        let info = plugin.info().clone();
        let program = plugin.program();
        let mut state = WorkerState {
            plugin,
            inputs: Vec::new(),
            outputs: Vec::new(),
            num_samples: 0,
            max_block_size: 512,
            pending: Vec::with_capacity(QUEUE_CAPACITY),
        };
        state.resize_buffers(info.num_inputs, info.num_outputs);

        tracing::debug!("Created threaded plugin '{}'", info.name);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                commands: DoubleBuffer::with_capacity(QUEUE_CAPACITY),
                done: SyncEvent::new(),
            }),
            forwarder,
            pool,
            info,
            program,
            event_scratch: Vec::with_capacity(QUEUE_CAPACITY),
        }
    }

    fn with_plugin<R>(&self, f: impl FnOnce(&mut dyn Plugin) -> R) -> R {
        let mut state = self.shared.state.lock();
        f(state.plugin.as_mut())
    }

    fn refresh_info(&mut self) {
        let info = self.with_plugin(|plugin| plugin.info().clone());
        self.info = info;
    }
}

impl DeferredPlugin for ThreadedPlugin {
    fn push_command(&mut self, command: Command) {
        self.shared.commands.push(command);
    }
}

impl Drop for ThreadedPlugin {
    fn drop(&mut self) {
        // pending commands are released with the buffers
        self.shared.commands.clear();
        tracing::debug!("Destroyed threaded plugin '{}'", self.info.name);
    }
}

impl Plugin for ThreadedPlugin {
    fn info(&self) -> &PluginDesc {
        &self.info
    }

    fn is_threaded(&self) -> bool {
        true
    }

    fn is_bridged(&self) -> bool {
        self.with_plugin(|plugin| plugin.is_bridged())
    }

    fn setup_processing(
        &mut self,
        sample_rate: SampleRate,
        max_block_size: Frames,
        mode: ProcessMode,
    ) -> Result<(), PluginError> {
        let mut state = self.shared.state.lock();
        state.plugin.setup_processing(sample_rate, max_block_size, mode)?;
        state.max_block_size = max_block_size;
        let (num_inputs, num_outputs) = (state.inputs.len(), state.outputs.len());
        state.resize_buffers(num_inputs, num_outputs);
        Ok(())
    }

    fn process(&mut self, data: &mut ProcessData) {
        let n = data.num_samples;
        {
            let mut state = self.shared.state.lock();
            if n > state.max_block_size {
                tracing::warn!(
                    "{}: block of {} frames exceeds maximum of {}",
                    self.info.name,
                    n,
                    state.max_block_size
                );
                state.max_block_size = n;
                let (num_inputs, num_outputs) = (state.inputs.len(), state.outputs.len());
                state.resize_buffers(num_inputs, num_outputs);
            }
            state.num_samples = n;
            for (ch, buffer) in state.inputs.iter_mut().enumerate() {
                match data.inputs.get(ch) {
                    Some(input) if input.len() >= n => buffer[..n].copy_from_slice(&input[..n]),
                    _ => buffer[..n].fill(0.0),
                }
            }
        }

        // a worker waiting on itself would deadlock, so nested calls run inline
        let task = Arc::clone(&self.shared) as Arc<dyn PoolTask>;
        if !is_dsp_thread() && self.pool.push(task) {
            self.shared.done.wait();
        } else {
            self.shared.process_block();
        }

        {
            let state = self.shared.state.lock();
            for (ch, output) in data.outputs.iter_mut().enumerate() {
                let len = n.min(output.len());
                match state.outputs.get(ch) {
                    Some(buffer) => output[..len].copy_from_slice(&buffer[..len]),
                    None => output[..len].fill(0.0),
                }
            }
        }

        self.forwarder.flush(&mut self.event_scratch);
    }

    fn suspend(&mut self) {
        self.with_plugin(|plugin| plugin.suspend());
    }

    fn resume(&mut self) {
        self.with_plugin(|plugin| plugin.resume());
    }

    fn set_num_speakers(
        &mut self,
        inputs: ChannelCount,
        outputs: ChannelCount,
    ) -> Result<(), PluginError> {
        {
            let mut state = self.shared.state.lock();
            state.plugin.set_num_speakers(inputs, outputs)?;
            state.resize_buffers(inputs, outputs);
        }
        self.refresh_info();
        Ok(())
    }

    fn latency_samples(&self) -> u32 {
        self.with_plugin(|plugin| plugin.latency_samples())
    }

    fn set_listener(&mut self, listener: Option<Arc<dyn PluginListener>>) {
        *self.forwarder.listener.lock() = listener;
    }

    fn transport_position(&self) -> f64 {
        self.with_plugin(|plugin| plugin.transport_position())
    }

    fn set_parameter(&mut self, index: usize, value: f32, sample_offset: u32) {
        DeferredPlugin::set_parameter(self, index, value, sample_offset);
    }

    fn set_parameter_string(&mut self, index: usize, value: &str, sample_offset: u32) -> bool {
        DeferredPlugin::set_parameter_string(self, index, value, sample_offset)
    }

    fn parameter(&self, index: usize) -> f32 {
        self.with_plugin(|plugin| plugin.parameter(index))
    }

    fn parameter_string(&self, index: usize) -> ParamDisplay {
        self.with_plugin(|plugin| plugin.parameter_string(index))
    }

    fn set_bypass(&mut self, state: Bypass) {
        DeferredPlugin::set_bypass(self, state);
    }

    fn set_program(&mut self, program: usize) {
        self.program = program;
        DeferredPlugin::set_program(self, program);
    }

    fn program(&self) -> usize {
        self.program
    }

    fn set_program_name(&mut self, name: &str) {
        DeferredPlugin::set_program_name(self, name);
    }

    fn program_name(&self) -> String {
        self.with_plugin(|plugin| plugin.program_name())
    }

    fn program_name_indexed(&self, index: usize) -> String {
        self.with_plugin(|plugin| plugin.program_name_indexed(index))
    }

    fn read_program_file(&mut self, path: &Path) -> Result<(), PluginError> {
        self.with_plugin(|plugin| plugin.read_program_file(path))
    }

    fn read_program_data(&mut self, data: &[u8]) -> Result<(), PluginError> {
        self.with_plugin(|plugin| plugin.read_program_data(data))
    }

    fn write_program_file(&mut self, path: &Path) -> Result<(), PluginError> {
        self.with_plugin(|plugin| plugin.write_program_file(path))
    }

    fn write_program_data(&mut self) -> Result<Vec<u8>, PluginError> {
        self.with_plugin(|plugin| plugin.write_program_data())
    }

    fn read_bank_file(&mut self, path: &Path) -> Result<(), PluginError> {
        let result = self.with_plugin(|plugin| plugin.read_bank_file(path));
        self.program = self.with_plugin(|plugin| plugin.program());
        result
    }

    fn read_bank_data(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let result = self.with_plugin(|plugin| plugin.read_bank_data(data));
        self.program = self.with_plugin(|plugin| plugin.program());
        result
    }

    fn write_bank_file(&mut self, path: &Path) -> Result<(), PluginError> {
        self.with_plugin(|plugin| plugin.write_bank_file(path))
    }

    fn write_bank_data(&mut self) -> Result<Vec<u8>, PluginError> {
        self.with_plugin(|plugin| plugin.write_bank_data())
    }

    fn open_editor(&mut self) {
        self.with_plugin(|plugin| plugin.open_editor());
    }

    fn close_editor(&mut self) {
        self.with_plugin(|plugin| plugin.close_editor());
    }

    fn editor_rect(&self) -> Option<Rect> {
        self.with_plugin(|plugin| plugin.editor_rect())
    }

    fn set_editor_pos(&mut self, x: i32, y: i32) {
        self.with_plugin(|plugin| plugin.set_editor_pos(x, y));
    }

    fn resize_editor(&mut self, width: i32, height: i32) {
        self.with_plugin(|plugin| plugin.resize_editor(width, height));
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
    use plugbridge_plugin::builtin::gain::GainPlugin;
    use std::thread::ThreadId;

    fn make_plugin(pool: &Arc<DspThreadPool>) -> ThreadedPlugin {
        let mut plugin = ThreadedPlugin::with_pool(Box::new(GainPlugin::default()), Arc::clone(pool));
        plugin
            .setup_processing(48000.0, 64, ProcessMode::Realtime)
            .unwrap();
        plugin.resume();
        plugin
    }

    fn run_block(plugin: &mut ThreadedPlugin, input: f32, frames: usize) -> Vec<f32> {
        let input_l = vec![input; frames];
        let input_r = vec![input; frames];
        let mut output_l = vec![0.0; frames];
        let mut output_r = vec![0.0; frames];
        let inputs: Vec<&[f32]> = vec![&input_l, &input_r];
        let mut outputs: Vec<&mut [f32]> = vec![&mut output_l, &mut output_r];
        plugin.process(&mut ProcessData {
            inputs: &inputs,
            outputs: &mut outputs,
            num_samples: frames,
        });
        output_l
    }

    #[derive(Default)]
    struct MidiRecorder(Mutex<Vec<(MidiEvent, ThreadId)>>);

    impl PluginListener for MidiRecorder {
        fn midi_event(&self, event: &MidiEvent) {
            self.0.lock().push((*event, std::thread::current().id()));
        }
    }

    #[test]
    fn test_processes_on_worker() {
        let pool = Arc::new(DspThreadPool::new(2));
        let mut plugin = make_plugin(&pool);
        assert!(plugin.is_threaded());

        Plugin::set_parameter(&mut plugin, 0, 0.5, 0);
        let output = run_block(&mut plugin, 1.0, 64);
        assert!(output.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_setters_are_deferred_until_next_block() {
        let pool = Arc::new(DspThreadPool::new(1));
        let mut plugin = make_plugin(&pool);

        Plugin::set_parameter(&mut plugin, 0, 0.25, 0);
        assert_eq!(plugin.parameter(0), 1.0);

        run_block(&mut plugin, 1.0, 16);
        assert_eq!(plugin.parameter(0), 0.25);
    }

    #[test]
    fn test_commands_apply_in_push_order() {
        let pool = Arc::new(DspThreadPool::new(2));
        let mut plugin = make_plugin(&pool);

        // the program change resets the gain, the later value must win
        Plugin::set_parameter(&mut plugin, 0, 0.1, 0);
        Plugin::set_program(&mut plugin, 3);
        assert!(Plugin::set_parameter_string(&mut plugin, 0, "0.75", 0));
        let output = run_block(&mut plugin, 1.0, 16);
        assert!(output.iter().all(|&s| s == 0.75));

        Plugin::set_parameter(&mut plugin, 0, 0.1, 0);
        Plugin::set_program(&mut plugin, 1);
        let output = run_block(&mut plugin, 1.0, 16);
        assert!(output.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_program_is_cached() {
        let pool = Arc::new(DspThreadPool::new(1));
        let mut plugin = make_plugin(&pool);

        Plugin::set_program(&mut plugin, 2);
        assert_eq!(plugin.program(), 2);
        assert_eq!(plugin.program_name(), "Unity");

        run_block(&mut plugin, 0.0, 16);
        assert_eq!(plugin.program_name(), "Silence");
    }

    #[test]
    fn test_events_delivered_after_block_on_caller_thread() {
        let pool = Arc::new(DspThreadPool::new(2));
        let mut plugin = make_plugin(&pool);
        let recorder = Arc::new(MidiRecorder::default());
        plugin.set_listener(Some(recorder.clone()));

        let note_on = MidiEvent::new(0x90, 64, 90, 0);
        Plugin::send_midi_event(&mut plugin, &note_on);
        assert!(recorder.0.lock().is_empty());

        run_block(&mut plugin, 0.0, 16);

        let events = recorder.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, note_on);
        assert_eq!(events[0].1, std::thread::current().id());
    }

    /// Notes whether the plugin was still locked when an event arrived
    struct LockWatcher {
        shared: Arc<Shared>,
        seen: Mutex<Vec<(bool, ThreadId)>>,
    }

    impl PluginListener for LockWatcher {
        fn midi_event(&self, _event: &MidiEvent) {
            let locked = self.shared.state.is_locked();
            self.seen.lock().push((locked, std::thread::current().id()));
        }
    }

    #[test]
    fn test_inline_block_delivers_events_after_unlock() {
        let pool = Arc::new(DspThreadPool::new(1));
        let mut plugin = make_plugin(&pool);
        let watcher = Arc::new(LockWatcher {
            shared: Arc::clone(&plugin.shared),
            seen: Mutex::new(Vec::new()),
        });
        plugin.set_listener(Some(watcher.clone()));

        // with the queue full the block runs on this thread
        let release = crate::pool::testing::block_queue(&pool);
        Plugin::set_parameter(&mut plugin, 0, 0.5, 0);
        Plugin::send_midi_event(&mut plugin, &MidiEvent::new(0x90, 60, 100, 0));
        let output = run_block(&mut plugin, 1.0, 16);
        release.send(()).unwrap();

        assert!(output.iter().all(|&s| s == 0.5));
        let seen = watcher.seen.lock();
        assert_eq!(*seen, vec![(false, std::thread::current().id())]);
    }

    #[test]
    fn test_parallel_plugins() {
        let pool = Arc::new(DspThreadPool::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let mut plugin = make_plugin(&pool);
                std::thread::spawn(move || {
                    let gain = (i + 1) as f32 * 0.25;
                    Plugin::set_parameter(&mut plugin, 0, gain, 0);
                    for _ in 0..100 {
                        let output = run_block(&mut plugin, 1.0, 64);
                        assert!(output.iter().all(|&s| s == gain));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_oversized_block_grows_buffers() {
        let pool = Arc::new(DspThreadPool::new(1));
        let mut plugin = make_plugin(&pool);
        let output = run_block(&mut plugin, 0.5, 256);
        assert_eq!(output.len(), 256);
        assert!(output.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_program_bank_io_goes_to_plugin() {
        let pool = Arc::new(DspThreadPool::new(1));
        let mut plugin = make_plugin(&pool);

        let bank = plugin.write_bank_data().unwrap();
        assert!(plugin.read_bank_data(&bank).is_ok());
        assert!(matches!(
            plugin.read_program_data(b"garbage"),
            Err(PluginError::FormatError(_))
        ));
    }
}
