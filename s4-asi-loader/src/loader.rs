//! Plugin loader using libloading
//!
//! Maps plugin files into the process and looks up their `InitAsi` export.
//! Mapped modules are never unloaded.

use s4_asi_api::{InitAsiFn, INIT_SYMBOL};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during plugin loading
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Cannot load plugin\n{}\n\n{source}", .path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Cannot load plugin\n{}\n\n{source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoaderError {
    /// The plugin file that failed to load
    pub fn path(&self) -> &Path {
        match self {
            Self::Map { path, .. } | Self::Unreadable { path, .. } => path,
        }
    }
}

/// Raw handle of a module mapped into the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A module mapped by a [`ModuleLoader`]
#[derive(Debug, Clone, Copy)]
pub struct MappedModule {
    pub handle: ModuleHandle,
    pub init: Option<InitAsiFn>,
}

/// Maps plugin files into the process
pub trait ModuleLoader: Send + Sync {
    /// Map the file at `path` and resolve its init export, if any
    fn load(&self, path: &Path) -> Result<MappedModule, LoaderError>;
}

/// A plugin that has been mapped into the process
#[derive(Debug, Clone)]
pub struct PluginRecord {
    /// File name inside the plugin directory
    pub file_name: OsString,
    /// Full path the module was mapped from
    pub path: PathBuf,
    /// Handle of the mapped module
    pub module: ModuleHandle,
    /// The `InitAsi` export, if the plugin has one
    pub init: Option<InitAsiFn>,
}

impl PluginRecord {
    /// Build the record for a module mapped from `path`
    pub fn new(path: &Path, module: MappedModule) -> Self {
        Self {
            file_name: path.file_name().map(OsString::from).unwrap_or_default(),
            path: path.to_path_buf(),
            module: module.handle,
            init: module.init,
        }
    }

    /// Whether the plugin asked to be initialized
    pub fn has_init(&self) -> bool {
        self.init.is_some()
    }
}

/// Result of loading a set of plugin files
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Successfully mapped plugins, in load order
    pub plugins: Vec<PluginRecord>,

    /// Plugins that failed to map
    pub failures: Vec<PathBuf>,
}

impl LoadReport {
    /// Returns true if all plugins loaded successfully
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of plugin files attempted
    pub fn total_found(&self) -> usize {
        self.plugins.len() + self.failures.len()
    }

    /// The init callbacks, in load order
    pub fn callbacks(&self) -> Vec<InitAsiFn> {
        self.plugins.iter().filter_map(|p| p.init).collect()
    }
}

/// Loads plugins through the OS dynamic loader
#[derive(Debug, Clone)]
pub struct NativeLoader {
    init_symbol: Vec<u8>,
}

impl Default for NativeLoader {
    fn default() -> Self {
        Self::new(INIT_SYMBOL)
    }
}

impl NativeLoader {
    /// Create a loader resolving `init_symbol` in every plugin
    pub fn new(init_symbol: &str) -> Self {
        let mut symbol = init_symbol.as_bytes().to_vec();
        symbol.push(0);
        Self {
            init_symbol: symbol,
        }
    }
}

impl ModuleLoader for NativeLoader {
    fn load(&self, path: &Path) -> Result<MappedModule, LoaderError> {
        // The file may have been removed since the directory was scanned
        std::fs::metadata(path).map_err(|source| LoaderError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        // SAFETY: plugins are trusted; running their initializers is the point
        let library = unsafe { libloading::Library::new(path) }.map_err(|source| {
            LoaderError::Map {
                path: path.to_path_buf(),
                source,
            }
        })?;

        // SAFETY: the plugin ABI declares the export as `void InitAsi(void)`
        let init = unsafe { library.get::<InitAsiFn>(&self.init_symbol) }
            .ok()
            .map(|symbol| *symbol);

        Ok(MappedModule {
            handle: leak(library),
            init,
        })
    }
}

/// Keep the module mapped for the rest of the process and return its handle
#[cfg(windows)]
fn leak(library: libloading::Library) -> ModuleHandle {
    ModuleHandle(libloading::os::windows::Library::from(library).into_raw() as usize)
}

#[cfg(unix)]
fn leak(library: libloading::Library) -> ModuleHandle {
    ModuleHandle(libloading::os::unix::Library::from(library).into_raw() as usize)
}
