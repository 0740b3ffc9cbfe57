//! s4-asi-loader: ASI plugin loader for S4
//!
//! Built as a DLL that the host maps at startup. It maps every `plugins/*.asi`
//! library and calls their `InitAsi` export once the host has left the loader
//! lock, by redirecting a call site in the host's code to [`wait_for_plugins`].

pub mod alert;
pub mod config;
pub mod discovery;
pub mod entry;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod patch;

pub use alert::{Alert, Notifier, Severity};
pub use config::{HostBinding, LoaderConfig, S4_HOST};
pub use discovery::{DiscoveryError, PluginRoot, PluginScanner};
pub use entry::{runtime, wait_for_plugins, AttachOutcome, LoaderRuntime};
pub use loader::{
    LoadReport, LoaderError, MappedModule, ModuleHandle, ModuleLoader, NativeLoader, PluginRecord,
};
pub use memory::{CodeMemory, HostImage};
pub use orchestrator::{Orchestrator, OrchestratorError, Phase, SpawnWorker, WorkerMode};
pub use patch::{CallPatch, PatchError};
pub use s4_asi_api::{InitAsiFn, INIT_SYMBOL};
