//! User-visible error reporting
//!
//! Everything the loader wants a human to see goes through a [`Notifier`]. On
//! Windows that is a modal message box; elsewhere the alert is only logged.

use crate::discovery::DiscoveryError;
use crate::loader::LoaderError;
use crate::patch::PatchError;

/// Dialog title for bootstrap and plugin mapping failures
pub const LOADER_ERROR_TITLE: &str = "ASI LOADER ERROR";

/// Dialog title for patching and worker failures
pub const RUNTIME_ERROR_TITLE: &str = "ASI Loader - Error";

/// Something went wrong that the user must be told about
#[derive(Debug)]
pub enum Alert<'a> {
    /// The host executable cannot be identified; nothing can proceed
    HostUnresolved(&'a DiscoveryError),
    /// The plugin directory exists but cannot be enumerated
    PluginDirectory(&'a DiscoveryError),
    /// A single plugin failed to map
    PluginLoad(&'a LoaderError),
    /// The host call site could not be redirected
    PatchFailed(&'a PatchError),
    /// Waiting for the worker did not end cleanly
    WorkerJoin(String),
    /// The trigger fired but no worker was ever started
    WorkerMissing,
}

/// How loud an alert is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    /// Shown, then the process terminates
    Fatal,
}

impl Alert<'_> {
    /// Dialog title
    pub fn title(&self) -> &'static str {
        match self {
            Self::HostUnresolved(_) | Self::PluginDirectory(_) | Self::PluginLoad(_) => {
                LOADER_ERROR_TITLE
            }
            Self::PatchFailed(_) | Self::WorkerJoin(_) | Self::WorkerMissing => {
                RUNTIME_ERROR_TITLE
            }
        }
    }

    /// Dialog body
    pub fn message(&self) -> String {
        match self {
            Self::HostUnresolved(e) | Self::PluginDirectory(e) => e.to_string(),
            Self::PluginLoad(e) => e.to_string(),
            Self::PatchFailed(e) => format!("Failed to patch the main function\n\n{}", e),
            Self::WorkerJoin(detail) => {
                format!("Failed to wait for asi loader thread: {}", detail)
            }
            Self::WorkerMissing => "asi loader thread failed to correctly initialize".to_string(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::HostUnresolved(_) => Severity::Fatal,
            Self::PluginLoad(_) | Self::PluginDirectory(_) => Severity::Warning,
            Self::PatchFailed(_) | Self::WorkerJoin(_) | Self::WorkerMissing => Severity::Error,
        }
    }

    /// Log the alert through `tracing`
    pub fn log(&self) {
        let message = self.message();
        match self.severity() {
            Severity::Warning => tracing::warn!(title = self.title(), "{}", message),
            Severity::Error | Severity::Fatal => {
                tracing::error!(title = self.title(), "{}", message)
            }
        }
    }
}

/// Shows alerts to the user
pub trait Notifier: Send + Sync {
    /// Present `alert`. For [`Severity::Fatal`] alerts an implementation may
    /// terminate the process and never return.
    fn notify(&self, alert: &Alert<'_>);
}

/// Notifier that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: &Alert<'_>) {
        alert.log();
    }
}

/// Notifier used by the loader on the current platform
#[cfg(windows)]
pub fn platform_notifier() -> std::sync::Arc<dyn Notifier> {
    std::sync::Arc::new(MessageBoxNotifier)
}

/// Notifier used by the loader on the current platform
#[cfg(not(windows))]
pub fn platform_notifier() -> std::sync::Arc<dyn Notifier> {
    std::sync::Arc::new(LogNotifier)
}

#[cfg(windows)]
pub use self::message_box::MessageBoxNotifier;

#[cfg(windows)]
mod message_box {
    use super::{Alert, Notifier, Severity};
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::System::Threading::ExitProcess;
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        MessageBoxW, MB_ICONERROR, MB_ICONEXCLAMATION, MB_OK, MB_SETFOREGROUND, MB_TOPMOST,
    };

    /// Modal, top-most message boxes
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MessageBoxNotifier;

    fn wide(text: &str) -> Vec<u16> {
        OsStr::new(text).encode_wide().chain(Some(0)).collect()
    }

    impl Notifier for MessageBoxNotifier {
        fn notify(&self, alert: &Alert<'_>) {
            alert.log();

            let icon = match alert.severity() {
                Severity::Warning => MB_ICONEXCLAMATION,
                Severity::Error | Severity::Fatal => MB_ICONERROR,
            };
            let text = wide(&alert.message());
            let caption = wide(alert.title());

            // SAFETY: both strings are nul-terminated and outlive the call
            unsafe {
                MessageBoxW(
                    std::ptr::null_mut(),
                    text.as_ptr(),
                    caption.as_ptr(),
                    icon | MB_OK | MB_TOPMOST | MB_SETFOREGROUND,
                );
            }

            if alert.severity() == Severity::Fatal {
                // SAFETY: terminating is the documented response to a fatal alert
                unsafe { ExitProcess(0) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_titles_follow_failure_kind() {
        let host = DiscoveryError::HostUnresolved(std::io::Error::other("no module"));
        let patch = PatchError::PreconditionFailed {
            address: 0x45C489,
            found: 0x90,
        };

        assert_eq!(Alert::HostUnresolved(&host).title(), "ASI LOADER ERROR");
        assert_eq!(Alert::PatchFailed(&patch).title(), "ASI Loader - Error");
        assert_eq!(Alert::WorkerMissing.title(), "ASI Loader - Error");
        assert_eq!(Alert::HostUnresolved(&host).severity(), Severity::Fatal);
    }

    #[test]
    fn test_plugin_load_message_names_file() {
        let error = LoaderError::Unreadable {
            path: PathBuf::from("plugins").join("broken.asi"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let alert = Alert::PluginLoad(&error);

        assert_eq!(alert.title(), LOADER_ERROR_TITLE);
        assert_eq!(alert.severity(), Severity::Warning);
        assert!(alert.message().starts_with("Cannot load plugin\n"));
        assert!(alert.message().contains("broken.asi"));
    }

    #[test]
    fn test_patch_message_includes_cause() {
        let error = PatchError::PreconditionFailed {
            address: 0x45C489,
            found: 0x90,
        };
        let message = Alert::PatchFailed(&error).message();

        assert!(message.starts_with("Failed to patch the main function"));
        assert!(message.contains("0x45c489"));
    }
}
