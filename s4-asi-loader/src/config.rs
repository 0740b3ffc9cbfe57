//! Loader configuration
//!
//! Everything is compiled in: the loader reads no files, registry keys or
//! environment variables of its own.

use crate::discovery::PluginRoot;
use crate::logging::TracingConfig;
use s4_asi_api::{INIT_SYMBOL, PLUGIN_PATTERN};

/// The host-specific part of the loader: where to hook and what to return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBinding {
    /// Executable the binding was made for
    pub name: &'static str,

    /// Offset from the image base of a `CALL rel32` that runs on the main
    /// thread after the loader lock has been released
    pub call_site_offset: usize,

    /// Value returned to the host in place of the replaced callee's result.
    /// The host treats it as "succeeded" and stays on its normal path.
    pub success_value: u8,
}

impl HostBinding {
    /// Address of the call site for an image loaded at `base`
    pub fn call_site(&self, base: usize) -> usize {
        base.wrapping_add(self.call_site_offset)
    }
}

/// The S4 main executable
pub const S4_HOST: HostBinding = HostBinding {
    name: "S4_Main.exe",
    call_site_offset: 0x5C489,
    success_value: 1,
};

/// Loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Directory plugins are discovered in
    pub plugin_root: PluginRoot,

    /// Shell pattern plugin file names must match
    pub plugin_pattern: String,

    /// Export resolved in every plugin and called on trigger
    pub init_symbol: String,

    /// Host call site and return value
    pub host: HostBinding,

    /// Subscriber installed by the worker; None leaves tracing alone
    pub tracing: Option<TracingConfig>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            plugin_root: PluginRoot::default(),
            plugin_pattern: PLUGIN_PATTERN.to_string(),
            init_symbol: INIT_SYMBOL.to_string(),
            host: S4_HOST,
            tracing: Some(TracingConfig::default()),
        }
    }
}
