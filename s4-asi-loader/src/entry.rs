//! Process attach and the patched call site
//!
//! [`LoaderRuntime`] bundles everything the loader keeps for the lifetime of
//! the process. On Windows a single instance is created from `DllMain`, which
//! redirects the host's call site to [`wait_for_plugins`] and arms the worker.

use crate::alert::{platform_notifier, Alert, Notifier};
use crate::config::LoaderConfig;
use crate::loader::{ModuleLoader, NativeLoader};
use crate::memory::CodeMemory;
use crate::orchestrator::{Orchestrator, TriggerOutcome, WorkerMode};
use crate::patch::CallPatch;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// What process attach achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOutcome {
    /// Whether the host call site now leads to the trigger
    pub patched: bool,
    /// How plugins are being loaded; None if the worker was already armed
    pub worker: Option<WorkerMode>,
}

/// Process-wide loader state
pub struct LoaderRuntime {
    config: LoaderConfig,
    orchestrator: Orchestrator,
    notifier: Arc<dyn Notifier>,
    patch: Mutex<Option<CallPatch>>,
}

impl LoaderRuntime {
    /// Runtime with the platform's module loader and notifier
    pub fn for_host(config: LoaderConfig) -> Self {
        let loader = Arc::new(NativeLoader::new(&config.init_symbol));
        Self::new(config, loader, platform_notifier())
    }

    pub fn new(
        config: LoaderConfig,
        loader: Arc<dyn ModuleLoader>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let orchestrator = Orchestrator::new(&config, loader, Arc::clone(&notifier));
        Self::with_orchestrator(config, orchestrator, notifier)
    }

    /// Runtime around a pre-built orchestrator
    pub fn with_orchestrator(
        config: LoaderConfig,
        orchestrator: Orchestrator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            notifier,
            patch: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Whether the host call site is currently redirected
    pub fn is_patched(&self) -> bool {
        self.patch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(CallPatch::is_installed)
    }

    /// Redirect the host call site to `trigger` and start loading plugins.
    ///
    /// Runs under the loader lock: only patches code and creates a thread. A
    /// failed patch is reported and loading continues, but the trigger will
    /// never run.
    pub fn attach(&self, memory: &impl CodeMemory, host_base: usize, trigger: usize) -> AttachOutcome {
        let patched = self.install_patch(memory, host_base, trigger);
        AttachOutcome {
            patched,
            worker: self.start_worker(),
        }
    }

    /// Start loading plugins without touching the host's code.
    ///
    /// Used when the host image cannot be located under the loader lock. No
    /// alert is raised here; the worker reports an unresolvable host once it
    /// runs outside the lock.
    pub fn start_unpatched(&self) -> AttachOutcome {
        AttachOutcome {
            patched: false,
            worker: self.start_worker(),
        }
    }

    fn start_worker(&self) -> Option<WorkerMode> {
        match self.orchestrator.start_worker() {
            Ok(mode) => Some(mode),
            Err(e) => {
                tracing::warn!(error = %e, "Process attach repeated");
                None
            }
        }
    }

    fn install_patch(&self, memory: &impl CodeMemory, host_base: usize, trigger: usize) -> bool {
        let mut slot = self.patch.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(CallPatch::is_installed) {
            return true;
        }

        let site = self.config.host.call_site(host_base);
        let mut patch = CallPatch::new(site, trigger);

        match patch.install(memory) {
            Ok(()) => {
                tracing::info!(
                    host = self.config.host.name,
                    "Hooked call at {:#x} (base {:#x}) to {:#x}",
                    site,
                    host_base,
                    patch.callee()
                );
                *slot = Some(patch);
                true
            }
            Err(e) => {
                self.notifier.notify(&Alert::PatchFailed(&e));
                false
            }
        }
    }

    /// Body of the patched call: join the worker, initialize plugins and
    /// report success to the host.
    ///
    /// Never unwinds: the caller is host code.
    pub fn trigger(&self) -> u8 {
        match catch_unwind(AssertUnwindSafe(|| self.orchestrator.trigger())) {
            Ok(TriggerOutcome { fired }) => tracing::debug!(fired, "Returning to host"),
            Err(_) => tracing::error!("Plugin initialization panicked, returning to host"),
        }
        self.config.host.success_value
    }

    /// Undo the call site redirect, if any
    pub fn detach(&self, memory: &impl CodeMemory) {
        let mut slot = self.patch.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(patch) = slot.as_mut().filter(|p| p.is_installed()) {
            match patch.uninstall(memory) {
                Ok(()) => tracing::info!("Restored host call at {:#x}", patch.address()),
                Err(e) => tracing::error!(error = %e, "Failed to restore host call"),
            }
        }
    }
}

static RUNTIME: OnceLock<LoaderRuntime> = OnceLock::new();

/// The process-wide runtime, once process attach has run
pub fn runtime() -> Option<&'static LoaderRuntime> {
    RUNTIME.get()
}

/// Replacement callee installed at the host call site.
///
/// Matches the replaced function's ABI: no arguments, byte-sized result.
pub extern "C" fn wait_for_plugins() -> u8 {
    match runtime() {
        Some(runtime) => runtime.trigger(),
        None => crate::config::S4_HOST.success_value,
    }
}

#[cfg(windows)]
mod dll {
    use super::{wait_for_plugins, LoaderRuntime, RUNTIME};
    use crate::config::LoaderConfig;
    use crate::memory::ProcessCode;
    use crate::orchestrator::WorkerMode;
    use std::ffi::c_void;
    use windows_sys::Win32::Foundation::{FreeLibrary, BOOL, HINSTANCE, HMODULE, TRUE};
    use windows_sys::Win32::System::LibraryLoader::{
        GetModuleHandleExW, GetModuleHandleW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
    };
    use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    /// Take an extra reference on this module so the worker's code stays mapped
    fn pin_self() -> Option<HMODULE> {
        let mut module: HMODULE = std::ptr::null_mut();
        // SAFETY: the address lies inside this module; the out pointer is valid
        let ok = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
                wait_for_plugins as *const () as *const u16,
                &mut module,
            )
        };
        (ok != 0).then_some(module)
    }

    fn process_attach() {
        let runtime = RUNTIME.get_or_init(|| LoaderRuntime::for_host(LoaderConfig::default()));

        let pin = pin_self();

        // SAFETY: a null name asks for the host executable's own module
        let host = unsafe { GetModuleHandleW(std::ptr::null()) };
        let outcome = if host.is_null() {
            tracing::error!(
                error = %std::io::Error::last_os_error(),
                "Cannot get host module handle, leaving the host unpatched"
            );
            runtime.start_unpatched()
        } else {
            runtime.attach(&ProcessCode, host as usize, wait_for_plugins as usize)
        };

        if outcome.worker != Some(WorkerMode::Threaded) {
            if let Some(module) = pin {
                // SAFETY: releases the reference taken by pin_self
                unsafe { FreeLibrary(module) };
            }
        }
    }

    #[no_mangle]
    pub unsafe extern "system" fn DllMain(
        _module: HINSTANCE,
        reason: u32,
        reserved: *mut c_void,
    ) -> BOOL {
        match reason {
            DLL_PROCESS_ATTACH => process_attach(),
            // a null reserved pointer means FreeLibrary, not process exit
            DLL_PROCESS_DETACH if reserved.is_null() => {
                if let Some(runtime) = RUNTIME.get() {
                    runtime.detach(&ProcessCode);
                }
            }
            _ => {}
        }
        TRUE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{LogNotifier, Severity};
    use crate::discovery::PluginRoot;
    use crate::loader::{LoaderError, MappedModule, ModuleHandle};
    use crate::memory::HostImage;
    use crate::orchestrator::Phase;
    use crate::patch::{encode_call, CALL_LEN};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const BASE: usize = 0x40_0000;

    struct NoInitLoader;

    impl ModuleLoader for NoInitLoader {
        fn load(&self, _path: &Path) -> Result<MappedModule, LoaderError> {
            Ok(MappedModule {
                handle: ModuleHandle(0x1000_0000),
                init: None,
            })
        }
    }

    fn image_with_call_site(config: &LoaderConfig) -> HostImage {
        let site = config.host.call_site(BASE);
        let mut bytes = vec![0xCC; config.host.call_site_offset + 0x10];
        let call = encode_call(site, BASE + 0x1000).unwrap();
        bytes[config.host.call_site_offset..][..CALL_LEN].copy_from_slice(&call);
        HostImage::new(BASE, bytes)
    }

    #[derive(Default)]
    struct CountingNotifier(Mutex<Vec<Severity>>);

    impl Notifier for CountingNotifier {
        fn notify(&self, alert: &Alert<'_>) {
            self.0.lock().unwrap().push(alert.severity());
        }
    }

    /// A dialog that cannot be shown
    struct PanickingNotifier;

    impl Notifier for PanickingNotifier {
        fn notify(&self, _alert: &Alert<'_>) {
            panic!("dialog failed");
        }
    }

    fn config_in(dir: &Path) -> LoaderConfig {
        LoaderConfig {
            plugin_root: PluginRoot::Directory(dir.to_path_buf()),
            tracing: None,
            ..Default::default()
        }
    }

    fn runtime_in(dir: &Path) -> LoaderRuntime {
        LoaderRuntime::new(config_in(dir), Arc::new(NoInitLoader), Arc::new(LogNotifier))
    }

    #[test]
    fn test_attach_patches_and_starts_worker() {
        let temp = TempDir::new().unwrap();
        let runtime = runtime_in(temp.path());
        let image = image_with_call_site(runtime.config());
        let trigger = BASE + 0x2000;

        let outcome = runtime.attach(&image, BASE, trigger);

        assert!(outcome.patched);
        assert_eq!(outcome.worker, Some(WorkerMode::Threaded));
        assert!(runtime.is_patched());
        let site = runtime.config().host.call_site(BASE);
        assert_eq!(
            image.read(site, CALL_LEN).unwrap(),
            encode_call(site, trigger).unwrap()
        );

        assert_eq!(runtime.trigger(), 1);
        assert_eq!(runtime.orchestrator().phase(), Phase::Done);
    }

    #[test]
    fn test_repeated_attach_keeps_first_patch() {
        let temp = TempDir::new().unwrap();
        let runtime = runtime_in(temp.path());
        let image = image_with_call_site(runtime.config());
        runtime.attach(&image, BASE, BASE + 0x2000);

        let again = runtime.attach(&image, BASE, BASE + 0x3000);

        assert!(again.patched);
        assert_eq!(again.worker, None);
        let site = runtime.config().host.call_site(BASE);
        assert_eq!(
            image.read(site, CALL_LEN).unwrap(),
            encode_call(site, BASE + 0x2000).unwrap()
        );
        runtime.trigger();
    }

    #[test]
    fn test_detach_restores_host_call() {
        let temp = TempDir::new().unwrap();
        let runtime = runtime_in(temp.path());
        let image = image_with_call_site(runtime.config());
        let site = runtime.config().host.call_site(BASE);
        let before = image.read(site, CALL_LEN).unwrap();

        runtime.attach(&image, BASE, BASE + 0x2000);
        runtime.trigger();
        runtime.detach(&image);

        assert!(!runtime.is_patched());
        assert_eq!(image.read(site, CALL_LEN).unwrap(), before);
    }

    #[test]
    fn test_trampoline_without_runtime_reports_success() {
        // nothing in the test binary initializes the global runtime
        assert!(runtime().is_none());
        assert_eq!(wait_for_plugins(), 1);
    }

    #[test]
    fn test_trigger_contains_panics() {
        let temp = TempDir::new().unwrap();
        let runtime = LoaderRuntime::new(
            config_in(temp.path()),
            Arc::new(NoInitLoader),
            Arc::new(PanickingNotifier),
        );

        // never attached, so the trigger raises the missing-worker alert
        assert_eq!(runtime.trigger(), 1);
        assert_eq!(runtime.orchestrator().phase(), Phase::Idle);
    }

    #[test]
    fn test_start_unpatched_defers_alerts_to_worker() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.asi"), b"").unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        let runtime = LoaderRuntime::new(
            config_in(temp.path()),
            Arc::new(NoInitLoader),
            notifier.clone(),
        );

        let outcome = runtime.start_unpatched();

        assert_eq!(
            outcome,
            AttachOutcome {
                patched: false,
                worker: Some(WorkerMode::Threaded),
            }
        );
        assert!(!runtime.is_patched());
        assert_eq!(runtime.orchestrator().wait_for_load(), Phase::Completed);
        assert_eq!(runtime.orchestrator().plugins().len(), 1);
        assert!(notifier.0.lock().unwrap().is_empty());
    }
}
