//! Deferred plugin commands.
//!
//! Setters called from the host's control thread must never block on the
//! audio thread. Instead they are captured as [`Command`] values, queued,
//! and applied to the real plugin right before the next processing block,
//! either on a DSP worker thread or in a bridge process.

mod command;
mod deferred;

pub use command::{Command, CommandKind, CommandString, MAX_SHORT_STRING_SIZE, apply_command};
pub use deferred::DeferredPlugin;
