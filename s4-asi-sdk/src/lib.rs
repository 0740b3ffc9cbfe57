//! s4-asi-sdk: SDK for writing ASI plugins
//!
//! Build your plugin as a `cdylib`, rename the resulting `.dll` to `.asi` and drop
//! it into the host's `plugins` directory.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use s4_asi_sdk::prelude::*;
//!
//! struct MyPlugin;
//!
//! impl AsiPlugin for MyPlugin {
//!     fn init() {
//!         // The host has finished its startup; safe to create windows,
//!         // load further libraries, spawn threads...
//!     }
//! }
//!
//! // Emits the `InitAsi` export the loader looks for
//! export_plugin!(MyPlugin);
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};

// Re-export everything from s4-asi-api
pub use s4_asi_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_plugin, AsiPlugin};
    pub use s4_asi_api::{InitAsiFn, INIT_SYMBOL};
}

/// Trait that plugins implement to receive the deferred initialization call
pub trait AsiPlugin {
    /// Called once on the host's main thread, outside the loader lock.
    fn init();
}

/// Runs `f`, containing any panic so it never unwinds across the C boundary
/// into the loader. Returns `false` if `f` panicked.
pub fn run_guarded(f: impl FnOnce()) -> bool {
    catch_unwind(AssertUnwindSafe(f)).is_ok()
}

/// Macro to export the `InitAsi` entry point
///
/// # Example
///
/// ```rust,ignore
/// struct MyPlugin;
///
/// impl AsiPlugin for MyPlugin {
///     fn init() { /* ... */ }
/// }
///
/// export_plugin!(MyPlugin);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($plugin:ty) => {
        #[no_mangle]
        #[allow(non_snake_case)]
        pub extern "C" fn InitAsi() {
            $crate::run_guarded(|| <$plugin as $crate::AsiPlugin>::init());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);

    struct CountingPlugin;

    impl AsiPlugin for CountingPlugin {
        fn init() {
            INIT_CALLS.fetch_add(1, Ordering::SeqCst);
        }
    }

    export_plugin!(CountingPlugin);

    #[test]
    fn test_export_calls_plugin_init() {
        let before = INIT_CALLS.load(Ordering::SeqCst);
        InitAsi();
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_export_matches_abi_signature() {
        let init: InitAsiFn = InitAsi;
        let _ = init;
    }

    #[test]
    fn test_run_guarded_contains_panics() {
        assert!(run_guarded(|| {}));
        assert!(!run_guarded(|| panic!("plugin bug")));
    }
}
