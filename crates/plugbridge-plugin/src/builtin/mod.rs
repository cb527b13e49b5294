//! Built-in plugins.
//!
//! These are implemented directly in Rust and implement the `Plugin` trait
//! like any externally loaded plugin. They are what the bridge server and the
//! demo application load when given a `builtin:` path.

pub mod gain;

use crate::Plugin;

/// Path prefix that selects a built-in plugin
pub const BUILTIN_PREFIX: &str = "builtin:";

/// Create a built-in plugin by name
///
/// Returns `None` if the name doesn't match any known built-in plugin.
///
/// # Examples
///
/// ```
/// use plugbridge_plugin::builtin;
///
/// let gain = builtin::create_builtin("gain").expect("gain plugin exists");
/// assert_eq!(gain.info().name, "Gain");
/// ```
pub fn create_builtin(name: &str) -> Option<Box<dyn Plugin>> {
    match name {
        "gain" => Some(Box::new(gain::GainPlugin::default())),
        _ => None,
    }
}

/// Create a built-in plugin from a `builtin:<name>` path
pub fn load_path(path: &str) -> Option<Box<dyn Plugin>> {
    path.strip_prefix(BUILTIN_PREFIX).and_then(create_builtin)
}
