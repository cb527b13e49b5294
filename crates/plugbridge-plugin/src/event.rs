//! Events a plugin sends back to the host.

use crate::PluginListener;

/// A short MIDI message with timing information
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MidiEvent {
    pub data: [u8; 3],
    /// Offset into the current block in samples
    pub delta: i32,
    pub detune: f32,
}

impl MidiEvent {
    pub fn new(status: u8, data1: u8, data2: u8, delta: i32) -> Self {
        Self {
            data: [status, data1, data2],
            delta,
            detune: 0.0,
        }
    }
}

/// A system exclusive message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SysexEvent {
    pub data: Box<[u8]>,
    /// Offset into the current block in samples
    pub delta: i32,
}

impl SysexEvent {
    pub fn new(data: impl Into<Box<[u8]>>, delta: i32) -> Self {
        Self {
            data: data.into(),
            delta,
        }
    }
}

/// A listener callback captured as a value, so it can be buffered and
/// delivered later on another thread
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    ParameterAutomated { index: usize, value: f32 },
    LatencyChanged(u32),
    UpdateDisplay,
    Crashed,
    Midi(MidiEvent),
    Sysex(SysexEvent),
}

impl PluginEvent {
    /// Deliver this event to a listener
    pub fn dispatch(&self, listener: &dyn PluginListener) {
        match self {
            Self::ParameterAutomated { index, value } => {
                listener.parameter_automated(*index, *value);
            }
            Self::LatencyChanged(samples) => listener.latency_changed(*samples),
            Self::UpdateDisplay => listener.update_display(),
            Self::Crashed => listener.plugin_crashed(),
            Self::Midi(event) => listener.midi_event(event),
            Self::Sysex(event) => listener.sysex_event(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl PluginListener for Recorder {
        fn parameter_automated(&self, index: usize, value: f32) {
            self.0.lock().unwrap().push(format!("param {index} {value}"));
        }

        fn midi_event(&self, event: &MidiEvent) {
            self.0.lock().unwrap().push(format!("midi {:?}", event.data));
        }

        fn sysex_event(&self, event: &SysexEvent) {
            self.0.lock().unwrap().push(format!("sysex {}", event.data.len()));
        }
    }

    #[test]
    fn test_dispatch() {
        let recorder = Recorder::default();
        let events = [
            PluginEvent::ParameterAutomated {
                index: 3,
                value: 0.5,
            },
            PluginEvent::Midi(MidiEvent::new(0x90, 60, 100, 0)),
            PluginEvent::Sysex(SysexEvent::new(vec![0xf0, 0x7e, 0xf7], 0)),
            // default implementation, ignored
            PluginEvent::UpdateDisplay,
        ];
        for event in &events {
            event.dispatch(&recorder);
        }

        let log = recorder.0.lock().unwrap();
        assert_eq!(
            *log,
            vec!["param 3 0.5", "midi [144, 60, 100]", "sysex 3"]
        );
    }
}
