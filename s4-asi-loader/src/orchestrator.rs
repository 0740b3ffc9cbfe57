//! Deferred plugin initialization
//!
//! Plugins are discovered and mapped on a worker thread that is spawned while
//! the OS loader lock is held. The worker does not start running until the lock
//! is released, so it may use the full OS surface. When the host later reaches
//! the patched call site, [`Orchestrator::trigger`] joins the worker and calls
//! every collected `InitAsi` in load order on the host's thread.
//!
//! ```text
//! Idle --start_worker--> Running --worker done--> Completed --trigger--> Firing --> Done
//!   \--start_worker (spawn failed, load inline)--> Completed
//! ```

use crate::alert::{Alert, Notifier};
use crate::config::LoaderConfig;
use crate::discovery::{PluginRoot, PluginScanner};
use crate::loader::{LoadReport, ModuleLoader, PluginRecord};
use crate::logging;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;

/// Errors that can occur while arming the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Worker already started (phase {0:?})")]
    AlreadyStarted(Phase),
}

/// Lifecycle of the deferred initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing started yet
    Idle,
    /// Worker is discovering and mapping plugins
    Running,
    /// All plugins are mapped, callbacks are pending
    Completed,
    /// Callbacks are being invoked
    Firing,
    /// Callbacks have been invoked
    Done,
}

/// How discovery and loading were run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// On a dedicated worker thread
    Threaded,
    /// On the calling thread, because no worker could be spawned
    Inline,
}

/// Outcome of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOutcome {
    /// Number of init callbacks invoked by this trigger
    pub fired: usize,
}

/// Starts the worker thread
pub trait SpawnWorker: Send + Sync {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;
}

/// Spawns a named OS thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl SpawnWorker for ThreadSpawner {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("asi-loader".to_string())
            .spawn(job)
    }
}

/// Discovery and loading, shared with the worker
struct Pipeline {
    root: PluginRoot,
    scanner: PluginScanner,
    loader: Arc<dyn ModuleLoader>,
    notifier: Arc<dyn Notifier>,
    tracing: Option<logging::TracingConfig>,
}

/// State written by the worker and read by the trigger
struct Shared {
    phase: Mutex<Phase>,
    report: Mutex<LoadReport>,
}

impl Shared {
    // Plugin records are only ever appended, so a panic mid-load leaves them usable
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self) -> MutexGuard<'_, LoadReport> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase() = phase;
    }

    /// Move from `from` to `to`; false if another transition got there first
    fn advance(&self, from: Phase, to: Phase) -> bool {
        let mut phase = self.phase();
        if *phase != from {
            return false;
        }
        *phase = to;
        true
    }
}

impl Pipeline {
    fn plugin_dir(&self) -> Option<PathBuf> {
        match self.root.resolve() {
            Ok(dir) => Some(dir),
            Err(e) => {
                self.notifier.notify(&Alert::HostUnresolved(&e));
                None
            }
        }
    }

    fn run(&self, shared: &Shared) {
        if let Some(config) = &self.tracing {
            logging::init_subscriber(config);
        }

        let Some(dir) = self.plugin_dir() else {
            return;
        };

        let paths = match self.scanner.scan_directory(&dir) {
            Ok(paths) => paths,
            Err(e) => {
                self.notifier.notify(&Alert::PluginDirectory(&e));
                return;
            }
        };

        for path in paths {
            match self.loader.load(&path) {
                Ok(module) => {
                    let record = PluginRecord::new(&path, module);
                    tracing::info!(
                        plugin = %record.file_name.to_string_lossy(),
                        module = %record.module,
                        init = record.has_init(),
                        "Plugin loaded"
                    );
                    shared.report().plugins.push(record);
                }
                Err(e) => {
                    self.notifier.notify(&Alert::PluginLoad(&e));
                    shared.report().failures.push(path);
                }
            }
        }

        let report = shared.report();
        tracing::info!(
            found = report.total_found(),
            loaded = report.plugins.len(),
            complete = report.is_success(),
            "Plugin loading finished"
        );
    }
}

/// Coordinates the worker and the trigger
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    shared: Arc<Shared>,
    spawner: Box<dyn SpawnWorker>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an idle orchestrator
    pub fn new(
        config: &LoaderConfig,
        loader: Arc<dyn ModuleLoader>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_spawner(config, loader, notifier, Box::new(ThreadSpawner))
    }

    /// Create an idle orchestrator that starts its worker through `spawner`
    pub fn with_spawner(
        config: &LoaderConfig,
        loader: Arc<dyn ModuleLoader>,
        notifier: Arc<dyn Notifier>,
        spawner: Box<dyn SpawnWorker>,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                root: config.plugin_root.clone(),
                scanner: PluginScanner::new(config.plugin_pattern.clone()),
                loader,
                notifier,
                tracing: config.tracing.clone(),
            }),
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                report: Mutex::new(LoadReport::default()),
            }),
            spawner,
            worker: Mutex::new(None),
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.shared.phase()
    }

    /// Plugins mapped so far, in load order
    pub fn plugins(&self) -> Vec<PluginRecord> {
        self.shared.report().plugins.clone()
    }

    /// Plugin files that failed to map
    pub fn failures(&self) -> Vec<PathBuf> {
        self.shared.report().failures.clone()
    }

    /// Start discovery and loading.
    ///
    /// Safe to call under the loader lock: it only creates a thread. If that
    /// fails, plugins are loaded right away on the calling thread.
    pub fn start_worker(&self) -> Result<WorkerMode, OrchestratorError> {
        {
            let mut phase = self.shared.phase();
            if *phase != Phase::Idle {
                return Err(OrchestratorError::AlreadyStarted(*phase));
            }
            *phase = Phase::Running;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let shared = Arc::clone(&self.shared);
        let job = Box::new(move || {
            pipeline.run(&shared);
            if !shared.advance(Phase::Running, Phase::Completed) {
                tracing::warn!("Worker finished after the trigger stopped waiting for it");
            }
        });

        match self.spawner.spawn(job) {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(WorkerMode::Threaded)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot spawn loader thread, loading plugins inline");
                self.pipeline.run(&self.shared);
                self.shared.advance(Phase::Running, Phase::Completed);
                Ok(WorkerMode::Inline)
            }
        }
    }

    /// Block until discovery and loading have finished, without firing
    /// callbacks. Returns the phase reached.
    pub fn wait_for_load(&self) -> Phase {
        // Held across the join so other waiters block until the worker is gone
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);

        match worker.take() {
            Some(handle) => {
                if let Err(detail) = join_worker(handle) {
                    self.pipeline.notifier.notify(&Alert::WorkerJoin(detail));
                    // mapped plugins stay valid; fire them anyway
                    self.shared.advance(Phase::Running, Phase::Completed);
                }
            }
            None if self.phase() == Phase::Idle => {
                self.pipeline.notifier.notify(&Alert::WorkerMissing);
            }
            None => {}
        }

        drop(worker);
        self.phase()
    }

    /// Join the worker and invoke every init callback once, in load order.
    ///
    /// Called on the host's main thread from the patched call site. Later calls
    /// fire nothing.
    pub fn trigger(&self) -> TriggerOutcome {
        self.wait_for_load();

        {
            let mut phase = self.shared.phase();
            if matches!(*phase, Phase::Firing | Phase::Done) {
                tracing::warn!("Trigger reached again, plugins already initialized");
                return TriggerOutcome { fired: 0 };
            }
            *phase = Phase::Firing;
        }

        // Copy out so callbacks may inspect the orchestrator
        let callbacks = self.shared.report().callbacks();
        for init in callbacks.iter().copied() {
            // SAFETY: resolved from a plugin that stays mapped; plugins are trusted
            unsafe { init() };
        }
        let fired = callbacks.len();

        self.shared.set_phase(Phase::Done);
        tracing::info!(fired, "Plugins initialized");
        TriggerOutcome { fired }
    }
}

/// Wait for the worker to exit. The error describes the anomaly for the dialog.
fn join_worker(handle: JoinHandle<()>) -> Result<(), String> {
    #[cfg(windows)]
    wait_signaled(&handle)?;

    handle
        .join()
        .map_err(|panic| format!("worker panicked: {}", panic_message(panic.as_ref())))
}

/// Wait on the thread handle directly, so a failed wait is reported instead of
/// panicking inside the join
#[cfg(windows)]
fn wait_signaled(handle: &JoinHandle<()>) -> Result<(), String> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{GetLastError, WAIT_OBJECT_0};
    use windows_sys::Win32::System::Threading::{WaitForSingleObject, INFINITE};

    // SAFETY: the thread handle stays open while `handle` is alive
    let status = unsafe { WaitForSingleObject(handle.as_raw_handle(), INFINITE) };
    if status == WAIT_OBJECT_0 {
        return Ok(());
    }

    // SAFETY: reads the calling thread's last error code
    let error = unsafe { GetLastError() };
    Err(format!("status code {:x}, error {}", status, error))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
