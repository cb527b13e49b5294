//! Plugin abstraction layer.
//!
//! This crate defines the `Plugin` façade that the hosting application talks
//! to, no matter whether the plugin runs directly, on a DSP worker thread or
//! inside a bridge process. It also defines the listener interface through
//! which plugins report back to the host, and the small value types that
//! cross those boundaries.

pub mod builtin;
mod desc;
mod event;
mod pascal;

pub use desc::{ParameterInfo, PluginDesc};
pub use event::{MidiEvent, PluginEvent, SysexEvent};
pub use pascal::{ParamDisplay, PascalString, ProgramName};

use plugbridge_core::{ChannelCount, Frames, Sample, SampleRate};
use std::path::Path;
use std::sync::Arc;

/// Audio buffers for one processing block
pub struct ProcessData<'a, 'b> {
    pub inputs: &'a [&'b [Sample]],
    pub outputs: &'a mut [&'b mut [Sample]],
    pub num_samples: Frames,
}

impl ProcessData<'_, '_> {
    /// Fill all output channels with silence
    pub fn clear_outputs(&mut self) {
        let n = self.num_samples;
        for output in self.outputs.iter_mut() {
            let len = n.min(output.len());
            output[..len].fill(0.0);
        }
    }

    /// Copy inputs to outputs (used for bypass)
    pub fn bypass(&mut self) {
        let n = self.num_samples;
        for (ch, output) in self.outputs.iter_mut().enumerate() {
            let len = n.min(output.len());
            match self.inputs.get(ch) {
                Some(input) if input.len() >= len => output[..len].copy_from_slice(&input[..len]),
                _ => output[..len].fill(0.0),
            }
        }
    }
}

/// Processing mode passed to `setup_processing`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessMode {
    #[default]
    Realtime,
    Offline,
}

impl ProcessMode {
    pub fn from_u8(val: u8) -> Self {
        if val == 1 { Self::Offline } else { Self::Realtime }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Realtime => 0,
            Self::Offline => 1,
        }
    }
}

/// Bypass state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bypass {
    #[default]
    Off,
    /// Stop processing and pass the input through unchanged
    Hard,
    /// Let the plugin handle the bypass itself (tails ring out)
    Soft,
}

impl Bypass {
    pub fn from_i32(val: i32) -> Self {
        match val {
            1 => Self::Hard,
            2 => Self::Soft,
            _ => Self::Off,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::Hard => 1,
            Self::Soft => 2,
        }
    }
}

/// Editor window rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Callbacks from a plugin to the host application.
///
/// All methods may be called from a non-UI thread (including the audio
/// thread); implementations must not block and must redispatch to their own
/// UI thread if needed.
pub trait PluginListener: Send + Sync {
    /// A parameter was changed by the plugin itself (GUI or automation)
    fn parameter_automated(&self, _index: usize, _value: f32) {}

    /// The plugin's processing latency changed
    fn latency_changed(&self, _samples: u32) {}

    /// The plugin asks the host to refresh its parameter display
    fn update_display(&self) {}

    /// The plugin (or the process hosting it) has crashed
    fn plugin_crashed(&self) {}

    /// MIDI output from the plugin
    fn midi_event(&self, _event: &MidiEvent) {}

    /// System exclusive output from the plugin
    fn sysex_event(&self, _event: &SysexEvent) {}
}

/// Main plugin trait that every backend implements
///
/// Setters are fire-and-forget: deferred backends only queue them and apply
/// them before the next processing block.
pub trait Plugin: Send {
    /// Get plugin information
    fn info(&self) -> &PluginDesc;

    /// Plugin runs on DSP worker threads
    fn is_threaded(&self) -> bool {
        false
    }

    /// Plugin runs in another process
    fn is_bridged(&self) -> bool {
        false
    }

    /// Prepare processing with sample rate, max block size and mode
    fn setup_processing(
        &mut self,
        sample_rate: SampleRate,
        max_block_size: Frames,
        mode: ProcessMode,
    ) -> Result<(), PluginError>;

    /// Process one block of audio. Never fails; errors are reported out of band.
    fn process(&mut self, data: &mut ProcessData);

    fn suspend(&mut self);

    fn resume(&mut self);

    /// Set the number of input and output channels
    fn set_num_speakers(
        &mut self,
        inputs: ChannelCount,
        outputs: ChannelCount,
    ) -> Result<(), PluginError>;

    fn latency_samples(&self) -> u32;

    fn set_listener(&mut self, listener: Option<Arc<dyn PluginListener>>);

    /// Current transport position in quarter notes
    fn transport_position(&self) -> f64;

    fn set_parameter(&mut self, index: usize, value: f32, sample_offset: u32);

    /// Set a parameter from its display string.
    ///
    /// Returns `true` if the value was accepted for application, which for
    /// deferred backends does not mean it has been applied yet.
    fn set_parameter_string(&mut self, index: usize, value: &str, sample_offset: u32) -> bool;

    fn parameter(&self, index: usize) -> f32;

    fn parameter_string(&self, index: usize) -> ParamDisplay;

    fn set_bypass(&mut self, state: Bypass);

    fn set_program(&mut self, program: usize);

    fn program(&self) -> usize;

    fn set_program_name(&mut self, name: &str);

    fn program_name(&self) -> String;

    fn program_name_indexed(&self, index: usize) -> String;

    fn read_program_file(&mut self, path: &Path) -> Result<(), PluginError>;

    fn read_program_data(&mut self, data: &[u8]) -> Result<(), PluginError>;

    fn write_program_file(&mut self, path: &Path) -> Result<(), PluginError>;

    fn write_program_data(&mut self) -> Result<Vec<u8>, PluginError>;

    fn read_bank_file(&mut self, path: &Path) -> Result<(), PluginError>;

    fn read_bank_data(&mut self, data: &[u8]) -> Result<(), PluginError>;

    fn write_bank_file(&mut self, path: &Path) -> Result<(), PluginError>;

    fn write_bank_data(&mut self) -> Result<Vec<u8>, PluginError>;

    fn open_editor(&mut self) {}

    fn close_editor(&mut self) {}

    fn editor_rect(&self) -> Option<Rect> {
        None
    }

    fn set_editor_pos(&mut self, _x: i32, _y: i32) {}

    fn resize_editor(&mut self, _width: i32, _height: i32) {}

    fn send_midi_event(&mut self, event: &MidiEvent);

    fn send_sysex_event(&mut self, event: &SysexEvent);

    fn set_tempo_bpm(&mut self, tempo: f64);

    fn set_time_signature(&mut self, numerator: i32, denominator: i32);

    fn set_transport_playing(&mut self, play: bool);

    fn set_transport_recording(&mut self, record: bool);

    fn set_transport_automation_writing(&mut self, writing: bool);

    fn set_transport_automation_reading(&mut self, reading: bool);

    fn set_transport_cycle_active(&mut self, active: bool);

    fn set_transport_cycle_start(&mut self, beat: f64);

    fn set_transport_cycle_end(&mut self, beat: f64);

    fn set_transport_position(&mut self, beat: f64);
}

/// Plugin-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Plugin processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Plugin format error: {0}")]
    FormatError(String),

    #[error("File error: {0}")]
    FileError(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Plugin crashed")]
    Crashed,
}

impl PluginError {
    /// Stable numeric code, used to transport errors between processes
    pub fn code(&self) -> u32 {
        match self {
            Self::InitializationFailed(_) => 1,
            Self::ProcessingFailed(_) => 2,
            Self::InvalidParameter(_) => 3,
            Self::FormatError(_) => 4,
            Self::FileError(_) => 5,
            Self::SystemError(_) => 6,
            Self::Crashed => 7,
        }
    }

    /// The error message without the category prefix
    pub fn message(&self) -> &str {
        match self {
            Self::InitializationFailed(msg)
            | Self::ProcessingFailed(msg)
            | Self::InvalidParameter(msg)
            | Self::FormatError(msg)
            | Self::FileError(msg)
            | Self::SystemError(msg) => msg,
            Self::Crashed => "",
        }
    }

    /// Rebuild an error from its code and message
    pub fn from_code(code: u32, message: &str) -> Self {
        let message = message.to_string();
        match code {
            1 => Self::InitializationFailed(message),
            2 => Self::ProcessingFailed(message),
            3 => Self::InvalidParameter(message),
            4 => Self::FormatError(message),
            5 => Self::FileError(message),
            7 => Self::Crashed,
            _ => Self::SystemError(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_survive_transport() {
        let errors = [
            PluginError::InitializationFailed("init".to_string()),
            PluginError::FormatError("bad magic".to_string()),
            PluginError::FileError("no such file".to_string()),
            PluginError::Crashed,
        ];
        for err in errors {
            let rebuilt = PluginError::from_code(err.code(), err.message());
            assert_eq!(rebuilt, err);
        }
        assert!(matches!(
            PluginError::from_code(999, "what"),
            PluginError::SystemError(_)
        ));
    }

    #[test]
    fn test_bypass_conversion() {
        for bypass in [Bypass::Off, Bypass::Hard, Bypass::Soft] {
            assert_eq!(Bypass::from_i32(bypass.as_i32()), bypass);
        }
        assert_eq!(Bypass::from_i32(42), Bypass::Off);
    }

    #[test]
    fn test_process_data_bypass() {
        let input_l = vec![0.25; 16];
        let input_r = vec![-0.25; 16];
        let mut output_l = vec![1.0; 16];
        let mut output_r = vec![1.0; 16];
        let mut output_extra = vec![1.0; 16];

        let inputs: Vec<&[f32]> = vec![&input_l, &input_r];
        let mut outputs: Vec<&mut [f32]> = vec![&mut output_l, &mut output_r, &mut output_extra];

        let mut data = ProcessData {
            inputs: &inputs,
            outputs: &mut outputs,
            num_samples: 16,
        };
        data.bypass();

        assert!(output_l.iter().all(|&s| s == 0.25));
        assert!(output_r.iter().all(|&s| s == -0.25));
        // no matching input
        assert!(output_extra.iter().all(|&s| s == 0.0));
    }
}
