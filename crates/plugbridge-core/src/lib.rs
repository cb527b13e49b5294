//! Scalar types and configuration shared across the plugbridge crates.

pub mod config;

pub use config::{BridgeConfig, ConfigError};

/// Sample rate in Hz
pub type SampleRate = f64;

/// Number of audio frames (samples per channel)
pub type Frames = usize;

/// Audio sample type
pub type Sample = f32;

/// Number of audio channels
pub type ChannelCount = usize;
