use crate::{Command, MAX_SHORT_STRING_SIZE};
use plugbridge_plugin::{Bypass, MidiEvent, SysexEvent};

/// A plugin whose setters are queued instead of applied immediately
///
/// Implementors provide [`push_command`](Self::push_command); every setter is
/// derived from it. None of the setters block or perform I/O, so they are
/// safe to call from any thread that owns the plugin handle.
pub trait DeferredPlugin {
    fn push_command(&mut self, command: Command);

    fn set_parameter(&mut self, index: usize, value: f32, sample_offset: u32) {
        self.push_command(Command::SetParamValue {
            index,
            offset: sample_offset,
            value,
        });
    }

    /// Always returns `true`: the string is accepted for deferred application,
    /// whether the plugin will parse it is only known later.
    fn set_parameter_string(&mut self, index: usize, value: &str, sample_offset: u32) -> bool {
        if value.len() > MAX_SHORT_STRING_SIZE {
            tracing::trace!("parameter {index}: long string, {} bytes", value.len());
        }
        self.push_command(Command::param_string(index, sample_offset, value));
        true
    }

    fn set_bypass(&mut self, state: Bypass) {
        self.push_command(Command::SetBypass(state));
    }

    fn set_program(&mut self, program: usize) {
        self.push_command(Command::SetProgram(program));
    }

    fn set_program_name(&mut self, name: &str) {
        self.push_command(Command::program_name(name));
    }

    fn send_midi_event(&mut self, event: &MidiEvent) {
        self.push_command(Command::SendMidi(*event));
    }

    fn send_sysex_event(&mut self, event: &SysexEvent) {
        self.push_command(Command::sysex(&event.data, event.delta));
    }

    fn set_tempo_bpm(&mut self, tempo: f64) {
        self.push_command(Command::SetTempo(tempo));
    }

    fn set_time_signature(&mut self, numerator: i32, denominator: i32) {
        self.push_command(Command::SetTimeSignature {
            numerator,
            denominator,
        });
    }

    fn set_transport_playing(&mut self, play: bool) {
        self.push_command(Command::SetTransportPlaying(play));
    }

    fn set_transport_recording(&mut self, record: bool) {
        self.push_command(Command::SetTransportRecording(record));
    }

    fn set_transport_automation_writing(&mut self, writing: bool) {
        self.push_command(Command::SetTransportAutomationWriting(writing));
    }

    fn set_transport_automation_reading(&mut self, reading: bool) {
        self.push_command(Command::SetTransportAutomationReading(reading));
    }

    fn set_transport_cycle_active(&mut self, active: bool) {
        self.push_command(Command::SetTransportCycleActive(active));
    }

    fn set_transport_cycle_start(&mut self, beat: f64) {
        self.push_command(Command::SetTransportCycleStart(beat));
    }

    fn set_transport_cycle_end(&mut self, beat: f64) {
        self.push_command(Command::SetTransportCycleEnd(beat));
    }

    fn set_transport_position(&mut self, beat: f64) {
        self.push_command(Command::SetTransportPosition(beat));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandKind;

    #[derive(Default)]
    struct Queue(Vec<Command>);

    impl DeferredPlugin for Queue {
        fn push_command(&mut self, command: Command) {
            self.0.push(command);
        }
    }

    #[test]
    fn test_setters_queue_in_order() {
        let mut queue = Queue::default();
        queue.set_parameter(1, 0.25, 16);
        assert!(queue.set_parameter_string(2, "a string far longer than eleven bytes", 0));
        queue.set_bypass(Bypass::Soft);
        queue.send_midi_event(&MidiEvent::new(0x80, 60, 0, 0));
        queue.send_sysex_event(&SysexEvent::new(vec![0xf0, 0xf7], 2));
        queue.set_transport_cycle_active(true);

        let kinds: Vec<CommandKind> = queue.0.iter().map(Command::kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::SetParamValue,
                CommandKind::SetParamString,
                CommandKind::SetBypass,
                CommandKind::SendMidi,
                CommandKind::SendSysex,
                CommandKind::SetTransportCycleActive,
            ]
        );
        assert_eq!(
            queue.0[0],
            Command::SetParamValue {
                index: 1,
                offset: 16,
                value: 0.25
            }
        );
    }
}
