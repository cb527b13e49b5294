//! Wire format of the bridge channels.
//!
//! Control messages are `bincode` encoded [`ShmCommand`]s written straight
//! into the channel buffer. Audio travels as raw native-endian `f32`
//! samples, one message per channel. UI messages are [`UiMessage`]s.

use crate::channel::ShmChannel;
use plugbridge_comms::Command;
use plugbridge_plugin::{Bypass, MidiEvent, PluginDesc, PluginError, SysexEvent};
use plugbridge_core::Sample;
use serde::{Deserialize, Serialize};

/// One control message on a request channel
///
/// String and byte payloads borrow from the channel buffer when decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShmCommand<'a> {
    // real-time commands, mirroring `Command`
    SetParamValue { index: u32, offset: u32, value: f32 },
    SetParamString { index: u32, offset: u32, value: &'a str },
    SetBypass(i32),
    SetProgram(u32),
    SetProgramName(&'a str),
    SendMidi { data: [u8; 3], delta: i32, detune: f32 },
    SendSysex { data: &'a [u8], delta: i32 },
    SetTempo(f64),
    SetTimeSignature { numerator: i32, denominator: i32 },
    SetTransportPlaying(bool),
    SetTransportRecording(bool),
    SetTransportAutomationWriting(bool),
    SetTransportAutomationReading(bool),
    SetTransportCycleActive(bool),
    SetTransportCycleStart(f64),
    SetTransportCycleEnd(f64),
    SetTransportPosition(f64),

    // requests
    CreatePlugin { id: u32, path: &'a str },
    DestroyPlugin { id: u32 },
    Suspend { id: u32 },
    Resume { id: u32 },
    SetupProcessing { id: u32, sample_rate: f64, max_block_size: u32, mode: u8 },
    SetNumSpeakers { id: u32, inputs: u32, outputs: u32 },
    ReadProgramFile { id: u32, path: &'a str },
    ReadProgramData { id: u32, data: &'a [u8] },
    ReadBankFile { id: u32, path: &'a str },
    ReadBankData { id: u32, data: &'a [u8] },
    WriteProgramFile { id: u32, path: &'a str },
    WriteProgramData { id: u32 },
    WriteBankFile { id: u32, path: &'a str },
    WriteBankData { id: u32 },
    /// Followed by `num_inputs` audio messages and then the queued commands
    Process { id: u32, num_samples: u32, num_inputs: u32, num_outputs: u32 },
    Quit,

    // replies
    PluginInfo(PluginDesc),
    PluginData(&'a [u8]),
    ParameterUpdate { index: u32, value: f32, display: &'a str },
    ParamAutomated { index: u32, value: f32 },
    ProgramNumber(u32),
    ProgramName(&'a str),
    ProgramNameIndexed { index: u32, name: &'a str },
    LatencyChanged(u32),
    UpdateDisplay,
    MidiReceived { data: [u8; 3], delta: i32, detune: f32 },
    SysexReceived { data: &'a [u8], delta: i32 },
    TransportPosition(f64),
    Error { code: u32, message: &'a str },
}

impl<'a> From<&'a Command> for ShmCommand<'a> {
    fn from(command: &'a Command) -> Self {
        match command {
            Command::SetParamValue {
                index,
                offset,
                value,
            } => Self::SetParamValue {
                index: *index as u32,
                offset: *offset,
                value: *value,
            },
            Command::SetParamString {
                index,
                offset,
                value,
            } => Self::SetParamString {
                index: *index as u32,
                offset: *offset,
                value: value.as_str(),
            },
            Command::SetBypass(state) => Self::SetBypass(state.as_i32()),
            Command::SetProgram(program) => Self::SetProgram(*program as u32),
            Command::SetProgramName(name) => Self::SetProgramName(name.as_str()),
            Command::SendMidi(event) => Self::SendMidi {
                data: event.data,
                delta: event.delta,
                detune: event.detune,
            },
            Command::SendSysex(event) => Self::SendSysex {
                data: &event.data,
                delta: event.delta,
            },
            Command::SetTempo(tempo) => Self::SetTempo(*tempo),
            Command::SetTimeSignature {
                numerator,
                denominator,
            } => Self::SetTimeSignature {
                numerator: *numerator,
                denominator: *denominator,
            },
            Command::SetTransportPlaying(b) => Self::SetTransportPlaying(*b),
            Command::SetTransportRecording(b) => Self::SetTransportRecording(*b),
            Command::SetTransportAutomationWriting(b) => Self::SetTransportAutomationWriting(*b),
            Command::SetTransportAutomationReading(b) => Self::SetTransportAutomationReading(*b),
            Command::SetTransportCycleActive(b) => Self::SetTransportCycleActive(*b),
            Command::SetTransportCycleStart(beat) => Self::SetTransportCycleStart(*beat),
            Command::SetTransportCycleEnd(beat) => Self::SetTransportCycleEnd(*beat),
            Command::SetTransportPosition(beat) => Self::SetTransportPosition(*beat),
        }
    }
}

impl ShmCommand<'_> {
    /// The deferred command this message carries, if it is one
    pub fn to_command(&self) -> Option<Command> {
        let command = match *self {
            Self::SetParamValue {
                index,
                offset,
                value,
            } => Command::SetParamValue {
                index: index as usize,
                offset,
                value,
            },
            Self::SetParamString {
                index,
                offset,
                value,
            } => Command::param_string(index as usize, offset, value),
            Self::SetBypass(state) => Command::SetBypass(Bypass::from_i32(state)),
            Self::SetProgram(program) => Command::SetProgram(program as usize),
            Self::SetProgramName(name) => Command::program_name(name),
            Self::SendMidi {
                data,
                delta,
                detune,
            } => Command::SendMidi(MidiEvent {
                data,
                delta,
                detune,
            }),
            Self::SendSysex { data, delta } => Command::sysex(data, delta),
            Self::SetTempo(tempo) => Command::SetTempo(tempo),
            Self::SetTimeSignature {
                numerator,
                denominator,
            } => Command::SetTimeSignature {
                numerator,
                denominator,
            },
            Self::SetTransportPlaying(b) => Command::SetTransportPlaying(b),
            Self::SetTransportRecording(b) => Command::SetTransportRecording(b),
            Self::SetTransportAutomationWriting(b) => Command::SetTransportAutomationWriting(b),
            Self::SetTransportAutomationReading(b) => Command::SetTransportAutomationReading(b),
            Self::SetTransportCycleActive(b) => Command::SetTransportCycleActive(b),
            Self::SetTransportCycleStart(beat) => Command::SetTransportCycleStart(beat),
            Self::SetTransportCycleEnd(beat) => Command::SetTransportCycleEnd(beat),
            Self::SetTransportPosition(beat) => Command::SetTransportPosition(beat),
            _ => return None,
        };
        Some(command)
    }

    /// The plugin a request is addressed to
    pub fn plugin_id(&self) -> Option<u32> {
        match *self {
            Self::CreatePlugin { id, .. }
            | Self::DestroyPlugin { id }
            | Self::Suspend { id }
            | Self::Resume { id }
            | Self::SetupProcessing { id, .. }
            | Self::SetNumSpeakers { id, .. }
            | Self::ReadProgramFile { id, .. }
            | Self::ReadProgramData { id, .. }
            | Self::ReadBankFile { id, .. }
            | Self::ReadBankData { id, .. }
            | Self::WriteProgramFile { id, .. }
            | Self::WriteProgramData { id }
            | Self::WriteBankFile { id, .. }
            | Self::WriteBankData { id }
            | Self::Process { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Encode an error reply
    pub fn error(err: &PluginError) -> ShmCommand<'_> {
        ShmCommand::Error {
            code: err.code(),
            message: err.message(),
        }
    }
}

/// Rebuild a MIDI event from a reply
pub fn midi_event(data: [u8; 3], delta: i32, detune: f32) -> MidiEvent {
    MidiEvent {
        data,
        delta,
        detune,
    }
}

/// Rebuild a SysEx event from a reply
pub fn sysex_event(data: &[u8], delta: i32) -> SysexEvent {
    SysexEvent::new(data, delta)
}

/// Commands exchanged over the UI queues
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UiCommand {
    WindowOpen,
    WindowClose,
    WindowSetPos { x: i32, y: i32 },
    WindowSetSize { width: i32, height: i32 },
    ParamAutomated { index: u32, value: f32 },
    LatencyChanged(u32),
    UpdateDisplay,
}

/// A UI command addressed to one plugin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: u32,
    pub command: UiCommand,
}

/// Protocol-level failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Decode(#[from] bincode::Error),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Message of {0} bytes doesn't fit into the channel")]
    TooLarge(usize),
}

impl From<ProtocolError> for PluginError {
    fn from(err: ProtocolError) -> Self {
        Self::SystemError(err.to_string())
    }
}

/// Append a control message to a request channel.
///
/// Returns `false` if it doesn't fit; nothing is written in that case.
pub(crate) fn add_command(channel: &ShmChannel, command: &ShmCommand) -> bool {
    let Ok(len) = bincode::serialized_size(command) else {
        return false;
    };
    channel.add_message_with(len as usize, |mut buf| {
        bincode::serialize_into(&mut buf, command).is_ok()
    })
}

/// Append one channel of audio to a request channel
pub(crate) fn add_audio(channel: &ShmChannel, samples: &[Sample]) -> bool {
    channel.add_message_with(std::mem::size_of_val(samples), |buf| {
        for (bytes, sample) in buf.chunks_exact_mut(4).zip(samples) {
            bytes.copy_from_slice(&sample.to_ne_bytes());
        }
        true
    })
}

/// Decode a control message
pub fn decode(bytes: &[u8]) -> Result<ShmCommand<'_>, ProtocolError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Copy an audio message into `out`, zero-filling whatever it doesn't cover.
/// Returns the number of samples copied.
pub fn read_audio(bytes: &[u8], out: &mut [Sample]) -> usize {
    let mut copied = 0;
    for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *sample = Sample::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        copied += 1;
    }
    out[copied..].fill(0.0);
    copied
}

/// Encode a UI message
pub fn encode_ui(message: &UiMessage) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serialize(message)?)
}

pub fn decode_ui(bytes: &[u8]) -> Result<UiMessage, ProtocolError> {
    Ok(bincode::deserialize(bytes)?)
}
