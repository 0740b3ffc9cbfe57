//! s4-asi-api: Shared ABI for the S4 ASI loader
//!
//! This crate defines the contract between the loader and the plugins it maps
//! into the host process. A plugin is an ordinary dynamic library with the
//! `.asi` extension placed in the `plugins` directory next to the host executable.
//! It may export a single initialization entry point, see [`INIT_SYMBOL`].

/// Name of the optional initialization export.
///
/// The loader calls it exactly once, on the host's main thread, after the host
/// has finished its own startup and the loader lock has been released.
pub const INIT_SYMBOL: &str = "InitAsi";

/// [`INIT_SYMBOL`] as a nul-terminated byte string for symbol lookups
pub const INIT_SYMBOL_NUL: &[u8] = b"InitAsi\0";

/// File extension of plugin libraries (without the dot)
pub const PLUGIN_EXTENSION: &str = "asi";

/// Shell pattern every plugin file name must match
pub const PLUGIN_PATTERN: &str = "*.asi";

/// Subdirectory of the host executable's directory that holds plugins
pub const PLUGIN_DIR: &str = "plugins";

/// Signature of the `InitAsi` export: `void InitAsi(void)` with C linkage.
pub type InitAsiFn = unsafe extern "C" fn();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_constants_agree() {
        assert_eq!(&INIT_SYMBOL_NUL[..INIT_SYMBOL.len()], INIT_SYMBOL.as_bytes());
        assert_eq!(INIT_SYMBOL_NUL.last(), Some(&0));
    }

    #[test]
    fn test_pattern_uses_extension() {
        assert_eq!(PLUGIN_PATTERN, format!("*.{}", PLUGIN_EXTENSION));
    }
}
