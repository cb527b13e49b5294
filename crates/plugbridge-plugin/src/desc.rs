//! Static plugin description.

use serde::{Deserialize, Serialize};

/// Parameter metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    /// Unit label shown next to the value ("dB", "Hz", ...)
    pub label: String,
}

/// Plugin metadata, as returned by probing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDesc {
    pub name: String,
    pub vendor: String,
    pub version: String,
    /// Unique identifier (e.g. "plugbridge.builtin.gain")
    pub unique_id: String,
    /// Where the plugin was loaded from
    pub path: String,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub parameters: Vec<ParameterInfo>,
    pub programs: Vec<String>,
    pub has_editor: bool,
    pub is_synth: bool,
}

impl PluginDesc {
    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn num_programs(&self) -> usize {
        self.programs.len()
    }

    /// Find a parameter index by name
    pub fn find_parameter(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }
}
