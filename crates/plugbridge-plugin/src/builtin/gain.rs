//! Gain plugin - simple volume control with MIDI thru.

use crate::{
    Bypass, MidiEvent, ParamDisplay, ParameterInfo, Plugin, PluginDesc, PluginError,
    PluginListener, ProcessData, ProcessMode, SysexEvent,
};
use plugbridge_core::{ChannelCount, Frames, SampleRate};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

const PROGRAM_MAGIC: &[u8; 4] = b"PBGP";
const BANK_MAGIC: &[u8; 4] = b"PBGB";

const FACTORY_PROGRAMS: [(&str, f32); 4] = [
    ("Unity", 1.0),
    ("Half", 0.5),
    ("Silence", 0.0),
    ("Boost", 2.0),
];

#[derive(Debug, Clone, PartialEq)]
struct Program {
    name: String,
    gain: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Transport {
    tempo: f64,
    numerator: i32,
    denominator: i32,
    playing: bool,
    recording: bool,
    automation_writing: bool,
    automation_reading: bool,
    cycle_active: bool,
    cycle_start: f64,
    cycle_end: f64,
    position: f64,
}

/// Simple gain/volume plugin
///
/// Multiplies all audio samples by a gain factor and forwards incoming MIDI
/// and SysEx events to the listener.
///
/// ## Parameter Range
///
/// Gain: 0.0 to 2.0 (linear)
/// - 0.0 = silence (−∞ dB)
/// - 1.0 = unity gain (0 dB, default)
/// - 2.0 = double amplitude (+6 dB)
pub struct GainPlugin {
    /// Gain value stored as f32 bits in an atomic (for thread-safe access)
    gain: AtomicU32,
    sample_rate: SampleRate,
    max_block_size: Frames,
    mode: ProcessMode,
    num_inputs: ChannelCount,
    num_outputs: ChannelCount,
    active: bool,
    bypass: Bypass,
    programs: Vec<Program>,
    program: usize,
    transport: Transport,
    midi_thru: Vec<MidiEvent>,
    sysex_thru: Vec<SysexEvent>,
    listener: Option<Arc<dyn PluginListener>>,
    info: PluginDesc,
}

impl Default for GainPlugin {
    fn default() -> Self {
        let programs: Vec<Program> = FACTORY_PROGRAMS
            .iter()
            .map(|&(name, gain)| Program {
                name: name.to_string(),
                gain,
            })
            .collect();

        Self {
            // Default gain: 1.0 (unity, 0 dB)
            gain: AtomicU32::new(1.0_f32.to_bits()),
            sample_rate: 48000.0,
            max_block_size: 512,
            mode: ProcessMode::Realtime,
            num_inputs: 2,
            num_outputs: 2,
            active: false,
            bypass: Bypass::Off,
            program: 0,
            transport: Transport {
                tempo: 120.0,
                numerator: 4,
                denominator: 4,
                ..Transport::default()
            },
            midi_thru: Vec::with_capacity(64),
            sysex_thru: Vec::new(),
            listener: None,
            info: PluginDesc {
                name: "Gain".to_string(),
                vendor: "plugbridge".to_string(),
                version: "1.0.0".to_string(),
                unique_id: "plugbridge.builtin.gain".to_string(),
                path: "builtin:gain".to_string(),
                num_inputs: 2,
                num_outputs: 2,
                parameters: vec![ParameterInfo {
                    name: "Gain".to_string(),
                    label: "x".to_string(),
                }],
                programs: programs.iter().map(|p| p.name.clone()).collect(),
                has_editor: false,
                is_synth: false,
            },
            programs,
        }
    }
}

impl GainPlugin {
    /// Get the current gain value (thread-safe)
    fn get_gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Acquire))
    }

    /// Set the gain value (thread-safe)
    fn set_gain(&self, value: f32) {
        self.gain.store(value.clamp(0.0, 2.0).to_bits(), Ordering::Release);
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    pub fn max_block_size(&self) -> Frames {
        self.max_block_size
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn tempo_bpm(&self) -> f64 {
        self.transport.tempo
    }

    pub fn time_signature(&self) -> (i32, i32) {
        (self.transport.numerator, self.transport.denominator)
    }

    pub fn is_playing(&self) -> bool {
        self.transport.playing
    }

    fn store_current_program(&mut self) {
        let gain = self.get_gain();
        if let Some(program) = self.programs.get_mut(self.program) {
            program.gain = gain;
        }
    }

    fn encode_program(program: &Program, out: &mut Vec<u8>) {
        out.extend_from_slice(&program.gain.to_le_bytes());
        let mut len = program.name.len().min(u8::MAX as usize);
        while !program.name.is_char_boundary(len) {
            len -= 1;
        }
        out.push(len as u8);
        out.extend_from_slice(&program.name.as_bytes()[..len]);
    }

    fn decode_program(data: &[u8]) -> Result<(Program, usize), PluginError> {
        let too_short = || PluginError::FormatError("program data too short".to_string());
        let gain_bytes: [u8; 4] = data.get(..4).ok_or_else(too_short)?.try_into().map_err(|_| too_short())?;
        let len = *data.get(4).ok_or_else(too_short)? as usize;
        let name = data.get(5..5 + len).ok_or_else(too_short)?;
        let name = std::str::from_utf8(name)
            .map_err(|e| PluginError::FormatError(format!("invalid program name: {e}")))?;
        Ok((
            Program {
                name: name.to_string(),
                gain: f32::from_le_bytes(gain_bytes),
            },
            5 + len,
        ))
    }

    fn check_magic<'a>(data: &'a [u8], magic: &[u8; 4]) -> Result<&'a [u8], PluginError> {
        match data.strip_prefix(magic.as_slice()) {
            Some(rest) => Ok(rest),
            None => Err(PluginError::FormatError("bad magic".to_string())),
        }
    }

    fn notify_update_display(&self) {
        if let Some(listener) = &self.listener {
            listener.update_display();
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, PluginError> {
    std::fs::read(path)
        .map_err(|e| PluginError::FileError(format!("{}: {e}", path.display())))
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), PluginError> {
    std::fs::write(path, data)
        .map_err(|e| PluginError::FileError(format!("{}: {e}", path.display())))
}

impl Plugin for GainPlugin {
    fn info(&self) -> &PluginDesc {
        &self.info
    }

    fn setup_processing(
        &mut self,
        sample_rate: SampleRate,
        max_block_size: Frames,
        mode: ProcessMode,
    ) -> Result<(), PluginError> {
        if sample_rate <= 0.0 || max_block_size == 0 {
            return Err(PluginError::InitializationFailed(format!(
                "invalid processing setup: {sample_rate} Hz, {max_block_size} frames"
            )));
        }
        self.sample_rate = sample_rate;
        self.max_block_size = max_block_size;
        self.mode = mode;
        Ok(())
    }

    fn process(&mut self, data: &mut ProcessData) {
        if self.bypass == Bypass::Hard || !self.active {
            data.bypass();
        } else {
            let gain = self.get_gain();
            let n = data.num_samples;
            for (ch, output) in data.outputs.iter_mut().enumerate() {
                let len = n.min(output.len());
                match data.inputs.get(ch) {
                    Some(input) if input.len() >= len => {
                        for (out, inp) in output[..len].iter_mut().zip(&input[..len]) {
                            *out = inp * gain;
                        }
                    }
                    _ => output[..len].fill(0.0),
                }
            }
        }

        if let Some(listener) = &self.listener {
            for event in self.midi_thru.drain(..) {
                listener.midi_event(&event);
            }
            for event in self.sysex_thru.drain(..) {
                listener.sysex_event(&event);
            }
        } else {
            self.midi_thru.clear();
            self.sysex_thru.clear();
        }

        if self.transport.playing {
            let beats = data.num_samples as f64 / self.sample_rate * self.transport.tempo / 60.0;
            self.transport.position += beats;
            if self.transport.cycle_active
                && self.transport.cycle_end > self.transport.cycle_start
                && self.transport.position >= self.transport.cycle_end
            {
                let length = self.transport.cycle_end - self.transport.cycle_start;
                self.transport.position -= length;
            }
        }
    }

    fn suspend(&mut self) {
        self.active = false;
    }

    fn resume(&mut self) {
        self.active = true;
    }

    fn set_num_speakers(
        &mut self,
        inputs: ChannelCount,
        outputs: ChannelCount,
    ) -> Result<(), PluginError> {
        if inputs > 64 || outputs > 64 {
            return Err(PluginError::InvalidParameter(format!(
                "unsupported channel count: {inputs} in, {outputs} out"
            )));
        }
        self.num_inputs = inputs;
        self.num_outputs = outputs;
        self.info.num_inputs = inputs;
        self.info.num_outputs = outputs;
        Ok(())
    }

    fn latency_samples(&self) -> u32 {
        0
    }

    fn set_listener(&mut self, listener: Option<Arc<dyn PluginListener>>) {
        self.listener = listener;
    }

    fn transport_position(&self) -> f64 {
        self.transport.position
    }

    fn set_parameter(&mut self, index: usize, value: f32, _sample_offset: u32) {
        if index == 0 {
            self.set_gain(value);
        } else {
            tracing::debug!("Gain: ignoring unknown parameter {index}");
        }
    }

    fn set_parameter_string(&mut self, index: usize, value: &str, _sample_offset: u32) -> bool {
        if index != 0 {
            return false;
        }
        match value.trim().trim_end_matches('x').trim().parse::<f32>() {
            Ok(gain) if gain.is_finite() => {
                self.set_gain(gain);
                true
            }
            _ => false,
        }
    }

    fn parameter(&self, index: usize) -> f32 {
        if index == 0 { self.get_gain() } else { 0.0 }
    }

    fn parameter_string(&self, index: usize) -> ParamDisplay {
        if index == 0 {
            ParamDisplay::new(&format!("{:.2}", self.get_gain()))
        } else {
            ParamDisplay::default()
        }
    }

    fn set_bypass(&mut self, state: Bypass) {
        self.bypass = state;
    }

    fn set_program(&mut self, program: usize) {
        if program >= self.programs.len() || program == self.program {
            return;
        }
        self.store_current_program();
        self.program = program;
        self.set_gain(self.programs[program].gain);
        self.notify_update_display();
    }

    fn program(&self) -> usize {
        self.program
    }

    fn set_program_name(&mut self, name: &str) {
        if let Some(program) = self.programs.get_mut(self.program) {
            program.name = name.to_string();
            self.info.programs[self.program] = name.to_string();
        }
    }

    fn program_name(&self) -> String {
        self.program_name_indexed(self.program)
    }

    fn program_name_indexed(&self, index: usize) -> String {
        self.programs
            .get(index)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    fn read_program_file(&mut self, path: &Path) -> Result<(), PluginError> {
        let data = read_file(path)?;
        self.read_program_data(&data)
    }

    fn read_program_data(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let rest = Self::check_magic(data, PROGRAM_MAGIC)?;
        let (program, _) = Self::decode_program(rest)?;
        self.set_gain(program.gain);
        self.set_program_name(&program.name);
        self.store_current_program();
        self.notify_update_display();
        Ok(())
    }

    fn write_program_file(&mut self, path: &Path) -> Result<(), PluginError> {
        let data = self.write_program_data()?;
        write_file(path, &data)
    }

    fn write_program_data(&mut self) -> Result<Vec<u8>, PluginError> {
        self.store_current_program();
        let mut data = PROGRAM_MAGIC.to_vec();
        Self::encode_program(&self.programs[self.program], &mut data);
        Ok(data)
    }

    fn read_bank_file(&mut self, path: &Path) -> Result<(), PluginError> {
        let data = read_file(path)?;
        self.read_bank_data(&data)
    }

    fn read_bank_data(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let mut rest = Self::check_magic(data, BANK_MAGIC)?;
        let mut programs = Vec::new();
        while !rest.is_empty() {
            let (program, used) = Self::decode_program(rest)?;
            programs.push(program);
            rest = &rest[used..];
        }
        if programs.is_empty() {
            return Err(PluginError::FormatError("empty bank".to_string()));
        }
        self.info.programs = programs.iter().map(|p| p.name.clone()).collect();
        self.programs = programs;
        self.program = 0;
        self.set_gain(self.programs[0].gain);
        self.notify_update_display();
        Ok(())
    }

    fn write_bank_file(&mut self, path: &Path) -> Result<(), PluginError> {
        let data = self.write_bank_data()?;
        write_file(path, &data)
    }

    fn write_bank_data(&mut self) -> Result<Vec<u8>, PluginError> {
        self.store_current_program();
        let mut data = BANK_MAGIC.to_vec();
        for program in &self.programs {
            Self::encode_program(program, &mut data);
        }
        Ok(data)
    }

    fn send_midi_event(&mut self, event: &MidiEvent) {
        self.midi_thru.push(*event);
    }

    fn send_sysex_event(&mut self, event: &SysexEvent) {
        self.sysex_thru.push(event.clone());
    }

    fn set_tempo_bpm(&mut self, tempo: f64) {
        if tempo > 0.0 {
            self.transport.tempo = tempo;
        }
    }

    fn set_time_signature(&mut self, numerator: i32, denominator: i32) {
        self.transport.numerator = numerator;
        self.transport.denominator = denominator;
    }

    fn set_transport_playing(&mut self, play: bool) {
        self.transport.playing = play;
    }

    fn set_transport_recording(&mut self, record: bool) {
        self.transport.recording = record;
    }

    fn set_transport_automation_writing(&mut self, writing: bool) {
        self.transport.automation_writing = writing;
    }

    fn set_transport_automation_reading(&mut self, reading: bool) {
        self.transport.automation_reading = reading;
    }

    fn set_transport_cycle_active(&mut self, active: bool) {
        self.transport.cycle_active = active;
    }

    fn set_transport_cycle_start(&mut self, beat: f64) {
        self.transport.cycle_start = beat;
    }

    fn set_transport_cycle_end(&mut self, beat: f64) {
        self.transport.cycle_end = beat;
    }

    fn set_transport_position(&mut self, beat: f64) {
        self.transport.position = beat;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn process_block(plugin: &mut GainPlugin, input: f32, frames: usize) -> Vec<f32> {
        let input_l = vec![input; frames];
        let input_r = vec![input; frames];
        let mut output_l = vec![0.0; frames];
        let mut output_r = vec![0.0; frames];

        let inputs: Vec<&[f32]> = vec![&input_l, &input_r];
        let mut outputs: Vec<&mut [f32]> = vec![&mut output_l, &mut output_r];
        let mut data = ProcessData {
            inputs: &inputs,
            outputs: &mut outputs,
            num_samples: frames,
        };
        plugin.process(&mut data);
        output_l
    }

    #[test]
    fn test_gain_processing() {
        let mut plugin = GainPlugin::default();
        plugin
            .setup_processing(48000.0, 512, ProcessMode::Realtime)
            .unwrap();
        plugin.resume();
        plugin.set_parameter(0, 0.5, 0);

        let output = process_block(&mut plugin, 1.0, 64);
        assert!(output.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_hard_bypass() {
        let mut plugin = GainPlugin::default();
        plugin.resume();
        plugin.set_parameter(0, 0.0, 0);
        plugin.set_bypass(Bypass::Hard);

        let output = process_block(&mut plugin, 0.75, 32);
        assert!(output.iter().all(|&s| s == 0.75));
    }

    #[test]
    fn test_parameter_clamping_and_strings() {
        let mut plugin = GainPlugin::default();
        plugin.set_parameter(0, 5.0, 0);
        assert_eq!(plugin.parameter(0), 2.0);

        assert!(plugin.set_parameter_string(0, "0.25 x", 0));
        assert_eq!(plugin.parameter(0), 0.25);
        assert_eq!(plugin.parameter_string(0), "0.25");

        assert!(!plugin.set_parameter_string(0, "loud", 0));
        assert!(!plugin.set_parameter_string(1, "1.0", 0));
        assert_eq!(plugin.parameter(0), 0.25);
    }

    #[test]
    fn test_invalid_setup() {
        let mut plugin = GainPlugin::default();
        let result = plugin.setup_processing(0.0, 512, ProcessMode::Offline);
        assert!(matches!(result, Err(PluginError::InitializationFailed(_))));
    }

    #[test]
    fn test_programs() {
        let mut plugin = GainPlugin::default();
        assert_eq!(plugin.info().num_programs(), 4);

        plugin.set_program(1);
        assert_eq!(plugin.program(), 1);
        assert_eq!(plugin.program_name(), "Half");
        assert_eq!(plugin.parameter(0), 0.5);

        plugin.set_program_name("Quiet");
        assert_eq!(plugin.program_name_indexed(1), "Quiet");
        assert_eq!(plugin.program_name_indexed(99), "");

        // out of range is ignored
        plugin.set_program(10);
        assert_eq!(plugin.program(), 1);
    }

    #[test]
    fn test_program_data() {
        let mut plugin = GainPlugin::default();
        plugin.set_parameter(0, 1.5, 0);
        plugin.set_program_name("Loud");
        let data = plugin.write_program_data().unwrap();

        let mut other = GainPlugin::default();
        other.read_program_data(&data).unwrap();
        assert_eq!(other.parameter(0), 1.5);
        assert_eq!(other.program_name(), "Loud");

        let result = other.read_program_data(b"nope");
        assert!(matches!(result, Err(PluginError::FormatError(_))));
        let result = other.read_program_data(b"PBGP\x00\x00");
        assert!(matches!(result, Err(PluginError::FormatError(_))));
    }

    #[test]
    fn test_long_program_name_keeps_whole_chars() {
        // 'é' is two bytes, so byte 255 falls inside the 128th char
        let name = "é".repeat(200);
        let mut plugin = GainPlugin::default();
        plugin.set_program_name(&name);
        let data = plugin.write_program_data().unwrap();

        let mut other = GainPlugin::default();
        other.read_program_data(&data).unwrap();
        assert_eq!(other.program_name(), "é".repeat(127));
    }

    #[test]
    fn test_bank_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gain.bank");

        let mut plugin = GainPlugin::default();
        plugin.set_program(3);
        plugin.set_parameter(0, 1.25, 0);
        plugin.write_bank_file(&path).unwrap();

        let mut other = GainPlugin::default();
        other.read_bank_file(&path).unwrap();
        other.set_program(3);
        assert_eq!(other.parameter(0), 1.25);
        assert_eq!(other.program_name(), "Boost");

        let missing = other.read_bank_file(&dir.path().join("missing.bank"));
        assert!(matches!(missing, Err(PluginError::FileError(_))));
    }

    #[test]
    fn test_midi_thru() {
        #[derive(Default)]
        struct Collect(Mutex<Vec<MidiEvent>>);
        impl PluginListener for Collect {
            fn midi_event(&self, event: &MidiEvent) {
                self.0.lock().unwrap().push(*event);
            }
        }

        let listener = Arc::new(Collect::default());
        let mut plugin = GainPlugin::default();
        plugin.set_listener(Some(listener.clone()));
        plugin.resume();

        let note_on = MidiEvent::new(0x90, 60, 100, 5);
        plugin.send_midi_event(&note_on);
        assert!(listener.0.lock().unwrap().is_empty());

        process_block(&mut plugin, 0.0, 16);
        assert_eq!(*listener.0.lock().unwrap(), vec![note_on]);

        // delivered only once
        process_block(&mut plugin, 0.0, 16);
        assert_eq!(listener.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_transport_advances_while_playing() {
        let mut plugin = GainPlugin::default();
        plugin
            .setup_processing(48000.0, 512, ProcessMode::Realtime)
            .unwrap();
        plugin.set_tempo_bpm(120.0);
        plugin.set_transport_position(4.0);

        process_block(&mut plugin, 0.0, 480);
        assert_eq!(plugin.transport_position(), 4.0);

        plugin.set_transport_playing(true);
        // 24000 samples at 48 kHz and 120 bpm = one beat
        for _ in 0..50 {
            process_block(&mut plugin, 0.0, 480);
        }
        assert!((plugin.transport_position() - 5.0).abs() < 1e-9);
    }
}
