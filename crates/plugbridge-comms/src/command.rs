//! The `Command` tagged union.

use plugbridge_plugin::{Bypass, MidiEvent, PascalString, Plugin, SysexEvent};

/// Strings up to this many bytes are stored inline in the command
pub const MAX_SHORT_STRING_SIZE: usize = 11;

/// A string argument of a command
///
/// Short strings live inside the command itself; longer strings own exactly
/// one heap buffer, which is released when the command is dropped.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandString {
    Short(PascalString<MAX_SHORT_STRING_SIZE>),
    Long(Box<str>),
}

impl CommandString {
    pub fn new(s: &str) -> Self {
        PascalString::try_new(s).map_or_else(|| Self::Long(s.into()), Self::Short)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Short(s) => s.as_str(),
            Self::Long(s) => s,
        }
    }

    /// Whether this string owns a heap allocation
    pub fn is_heap(&self) -> bool {
        matches!(self, Self::Long(_))
    }
}

/// A deferred plugin operation
///
/// Commands are moved, never copied: each heap-owning command releases its
/// buffer exactly once, whether it was applied or discarded.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetParamValue {
        index: usize,
        offset: u32,
        value: f32,
    },
    SetParamString {
        index: usize,
        offset: u32,
        value: CommandString,
    },
    SetBypass(Bypass),
    SetProgram(usize),
    SetProgramName(CommandString),
    SendMidi(MidiEvent),
    SendSysex(SysexEvent),
    SetTempo(f64),
    SetTimeSignature {
        numerator: i32,
        denominator: i32,
    },
    SetTransportPlaying(bool),
    SetTransportRecording(bool),
    SetTransportAutomationWriting(bool),
    SetTransportAutomationReading(bool),
    SetTransportCycleActive(bool),
    SetTransportCycleStart(f64),
    SetTransportCycleEnd(f64),
    SetTransportPosition(f64),
}

/// Tag of a [`Command`], without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    SetParamValue,
    SetParamString,
    SetBypass,
    SetProgram,
    SetProgramName,
    SendMidi,
    SendSysex,
    SetTempo,
    SetTimeSignature,
    SetTransportPlaying,
    SetTransportRecording,
    SetTransportAutomationWriting,
    SetTransportAutomationReading,
    SetTransportCycleActive,
    SetTransportCycleStart,
    SetTransportCycleEnd,
    SetTransportPosition,
}

impl Command {
    /// Build a string parameter command, allocating only for long strings
    pub fn param_string(index: usize, offset: u32, value: &str) -> Self {
        Self::SetParamString {
            index,
            offset,
            value: CommandString::new(value),
        }
    }

    /// Build a program name command, allocating only for long names
    pub fn program_name(name: &str) -> Self {
        Self::SetProgramName(CommandString::new(name))
    }

    /// Build a SysEx command. The payload is always copied.
    pub fn sysex(data: &[u8], delta: i32) -> Self {
        Self::SendSysex(SysexEvent::new(data, delta))
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetParamValue { .. } => CommandKind::SetParamValue,
            Self::SetParamString { .. } => CommandKind::SetParamString,
            Self::SetBypass(_) => CommandKind::SetBypass,
            Self::SetProgram(_) => CommandKind::SetProgram,
            Self::SetProgramName(_) => CommandKind::SetProgramName,
            Self::SendMidi(_) => CommandKind::SendMidi,
            Self::SendSysex(_) => CommandKind::SendSysex,
            Self::SetTempo(_) => CommandKind::SetTempo,
            Self::SetTimeSignature { .. } => CommandKind::SetTimeSignature,
            Self::SetTransportPlaying(_) => CommandKind::SetTransportPlaying,
            Self::SetTransportRecording(_) => CommandKind::SetTransportRecording,
            Self::SetTransportAutomationWriting(_) => CommandKind::SetTransportAutomationWriting,
            Self::SetTransportAutomationReading(_) => CommandKind::SetTransportAutomationReading,
            Self::SetTransportCycleActive(_) => CommandKind::SetTransportCycleActive,
            Self::SetTransportCycleStart(_) => CommandKind::SetTransportCycleStart,
            Self::SetTransportCycleEnd(_) => CommandKind::SetTransportCycleEnd,
            Self::SetTransportPosition(_) => CommandKind::SetTransportPosition,
        }
    }
}

/// Apply a command to a plugin
///
/// The command is consumed; any buffer it owns is released afterwards.
pub fn apply_command(plugin: &mut dyn Plugin, command: Command) {
    match command {
        Command::SetParamValue {
            index,
            offset,
            value,
        } => plugin.set_parameter(index, value, offset),
        Command::SetParamString {
            index,
            offset,
            value,
        } => {
            if !plugin.set_parameter_string(index, value.as_str(), offset) {
                tracing::debug!(
                    "{}: parameter {} rejected string {:?}",
                    plugin.info().name,
                    index,
                    value.as_str()
                );
            }
        }
        Command::SetBypass(state) => plugin.set_bypass(state),
        Command::SetProgram(program) => plugin.set_program(program),
        Command::SetProgramName(name) => plugin.set_program_name(name.as_str()),
        Command::SendMidi(event) => plugin.send_midi_event(&event),
        Command::SendSysex(event) => plugin.send_sysex_event(&event),
        Command::SetTempo(tempo) => plugin.set_tempo_bpm(tempo),
        Command::SetTimeSignature {
            numerator,
            denominator,
        } => plugin.set_time_signature(numerator, denominator),
        Command::SetTransportPlaying(play) => plugin.set_transport_playing(play),
        Command::SetTransportRecording(record) => plugin.set_transport_recording(record),
        Command::SetTransportAutomationWriting(writing) => {
            plugin.set_transport_automation_writing(writing);
        }
        Command::SetTransportAutomationReading(reading) => {
            plugin.set_transport_automation_reading(reading);
        }
        Command::SetTransportCycleActive(active) => plugin.set_transport_cycle_active(active),
        Command::SetTransportCycleStart(beat) => plugin.set_transport_cycle_start(beat),
        Command::SetTransportCycleEnd(beat) => plugin.set_transport_cycle_end(beat),
        Command::SetTransportPosition(beat) => plugin.set_transport_position(beat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugbridge_plugin::builtin::gain::GainPlugin;

    #[test]
    fn test_short_and_long_strings() {
        let short = CommandString::new("12.5");
        assert!(!short.is_heap());
        assert_eq!(short.as_str(), "12.5");

        let boundary = CommandString::new("exactly 11!");
        assert!(!boundary.is_heap());

        let long = CommandString::new("exactly 12!!");
        assert!(long.is_heap());
        assert_eq!(long.as_str(), "exactly 12!!");
    }

    #[test]
    fn test_kind() {
        assert_eq!(
            Command::param_string(0, 0, "1.0").kind(),
            CommandKind::SetParamString
        );
        assert_eq!(Command::sysex(&[0xf0, 0xf7], 0).kind(), CommandKind::SendSysex);
        assert_eq!(
            Command::SetTransportCycleEnd(8.0).kind(),
            CommandKind::SetTransportCycleEnd
        );
    }

    #[test]
    fn test_sysex_payload_is_copied() {
        let mut data = vec![0xf0, 0x01, 0xf7];
        let command = Command::sysex(&data, 3);
        data[1] = 0x02;
        match command {
            Command::SendSysex(event) => {
                assert_eq!(&*event.data, &[0xf0, 0x01, 0xf7]);
                assert_eq!(event.delta, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_apply_commands() {
        let mut plugin = GainPlugin::default();
        let commands = vec![
            Command::SetParamValue {
                index: 0,
                offset: 0,
                value: 0.5,
            },
            Command::SetProgram(2),
            Command::program_name("A very long program name"),
            Command::param_string(0, 0, "1.5"),
            Command::SetTempo(90.0),
            Command::SetTimeSignature {
                numerator: 7,
                denominator: 8,
            },
            Command::SetTransportPlaying(true),
            Command::SetTransportPosition(16.0),
        ];
        for command in commands {
            apply_command(&mut plugin, command);
        }

        assert_eq!(plugin.program(), 2);
        assert_eq!(plugin.program_name(), "A very long program name");
        assert_eq!(plugin.parameter(0), 1.5);
        assert_eq!(plugin.tempo_bpm(), 90.0);
        assert_eq!(plugin.time_signature(), (7, 8));
        assert!(plugin.is_playing());
        assert_eq!(plugin.transport_position(), 16.0);
    }
}
