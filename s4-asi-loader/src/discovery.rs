//! Plugin discovery and directory scanning
//!
//! Finds plugin files next to the host executable and puts them into the order
//! they are loaded in.

use s4_asi_api::{PLUGIN_DIR, PLUGIN_PATTERN};
use std::cmp::Ordering;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during plugin discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Cannot get file name of the host executable: {0}")]
    HostUnresolved(#[source] std::io::Error),

    #[error("Failed to read plugin directory {}: {source}", .path.display())]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the plugin directory lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginRoot {
    /// A subdirectory of the directory holding the host executable
    HostRelative(PathBuf),
    /// An explicit directory
    Directory(PathBuf),
}

impl Default for PluginRoot {
    fn default() -> Self {
        Self::HostRelative(PathBuf::from(PLUGIN_DIR))
    }
}

impl PluginRoot {
    /// Resolve to an absolute directory path
    pub fn resolve(&self) -> Result<PathBuf, DiscoveryError> {
        match self {
            Self::HostRelative(subdir) => {
                let exe = std::env::current_exe().map_err(DiscoveryError::HostUnresolved)?;
                Ok(plugin_dir_for(&exe, subdir))
            }
            Self::Directory(dir) => Ok(dir.clone()),
        }
    }
}

/// The plugin directory belonging to the executable at `exe`
pub fn plugin_dir_for(exe: &Path, subdir: impl AsRef<Path>) -> PathBuf {
    exe.parent()
        .unwrap_or_else(|| Path::new(""))
        .join(subdir)
}

/// Plugin directory scanner
#[derive(Debug, Clone)]
pub struct PluginScanner {
    pattern: String,
}

impl Default for PluginScanner {
    fn default() -> Self {
        Self::new(PLUGIN_PATTERN)
    }
}

impl PluginScanner {
    /// Create a scanner accepting file names that match the shell `pattern`
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Whether `name` is accepted as a plugin file name
    pub fn accepts(&self, name: &OsStr) -> bool {
        matches_pattern(&self.pattern, &name.to_string_lossy())
    }

    /// Scan a directory for plugin files, in load order.
    ///
    /// A missing directory yields no plugins.
    pub fn scan_directory(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, DiscoveryError> {
        let dir = dir.as_ref();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %dir.display(), "Plugin directory does not exist");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(DiscoveryError::ReadDirectory {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut names = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|source| DiscoveryError::ReadDirectory {
                path: dir.to_path_buf(),
                source,
            })?;

            let name = entry.file_name();
            // Wildcard queries may match short 8.3 aliases, so check the real name
            if !self.accepts(&name) {
                continue;
            }

            if is_directory(&entry) {
                tracing::debug!(name = %name.to_string_lossy(), "Skipping directory");
                continue;
            }

            names.push(name);
        }

        sort_load_order(&mut names);

        let plugins: Vec<PathBuf> = names.into_iter().map(|name| dir.join(name)).collect();
        tracing::info!(dir = %dir.display(), count = plugins.len(), "Discovered plugins");
        Ok(plugins)
    }
}

fn is_directory(entry: &std::fs::DirEntry) -> bool {
    match entry.file_type() {
        Ok(kind) if kind.is_symlink() => entry.path().is_dir(),
        Ok(kind) => kind.is_dir(),
        Err(_) => entry.path().is_dir(),
    }
}

/// Sort file names case-insensitively, breaking ties by the exact name
pub fn sort_load_order(names: &mut [OsString]) {
    names.sort_by(|a, b| compare_load_order(a, b));
}

/// Load order of two plugin file names
pub fn compare_load_order(a: &OsStr, b: &OsStr) -> Ordering {
    let folded = |name: &OsStr| name.to_string_lossy().to_lowercase();
    folded(a).cmp(&folded(b)).then_with(|| a.cmp(b))
}

/// Match `name` against a shell pattern with `*` and `?` wildcards, ignoring case.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
    let name: Vec<char> = name.chars().flat_map(char::to_lowercase).collect();

    let (mut p, mut n) = (0, 0);
    // position of the last '*' and the name index it resumed at
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, resumed)) => {
                    p = star + 1;
                    n = resumed + 1;
                    backtrack = Some((star, resumed + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn file_names(plugins: &[PathBuf]) -> Vec<String> {
        plugins
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("*.asi", "mod.asi"));
        assert!(matches_pattern("*.asi", "MOD.ASI"));
        assert!(matches_pattern("*.asi", ".asi"));
        assert!(matches_pattern("*.asi", "a.b.asi"));
        assert!(!matches_pattern("*.asi", "foo.asi.txt"));
        assert!(!matches_pattern("*.asi", "foo.asix"));
        assert!(!matches_pattern("*.asi", "foo.as"));
        assert!(!matches_pattern("*.asi", "fooasi"));
        assert!(matches_pattern("m?d.*", "mod.asi"));
        assert!(matches_pattern("*", ""));
        assert!(!matches_pattern("?", ""));
    }

    #[test]
    fn test_load_order_ignores_case() {
        let mut names: Vec<OsString> = ["c.asi", "B.asi", "a.asi", "D.asi"]
            .iter()
            .map(OsString::from)
            .collect();

        sort_load_order(&mut names);

        assert_eq!(names, ["a.asi", "B.asi", "c.asi", "D.asi"]);
    }

    #[test]
    fn test_load_order_keeps_case_variants_distinct() {
        let mut names: Vec<OsString> = ["a.asi", "b.asi", "A.asi"]
            .iter()
            .map(OsString::from)
            .collect();

        sort_load_order(&mut names);

        assert_eq!(names, ["A.asi", "a.asi", "b.asi"]);
    }

    #[test]
    fn test_scan_missing_directory() {
        let temp = TempDir::new().unwrap();
        let scanner = PluginScanner::default();

        let plugins = scanner.scan_directory(temp.path().join("plugins")).unwrap();

        assert!(plugins.is_empty());
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp = TempDir::new().unwrap();
        let scanner = PluginScanner::default();

        let plugins = scanner.scan_directory(temp.path()).unwrap();

        assert!(plugins.is_empty());
    }

    #[test]
    fn test_scan_orders_plugins() {
        let temp = TempDir::new().unwrap();
        for name in ["b.asi", "a.asi", "C.asi"] {
            fs::write(temp.path().join(name), b"").unwrap();
        }

        let plugins = PluginScanner::default().scan_directory(temp.path()).unwrap();

        assert_eq!(file_names(&plugins), ["a.asi", "b.asi", "C.asi"]);
        assert!(plugins.iter().all(|p| p.starts_with(temp.path())));
    }

    #[test]
    fn test_scan_rejects_near_matches() {
        let temp = TempDir::new().unwrap();
        for name in ["foo.asi.txt", "foo.asix", "readme.txt", "real.asi"] {
            fs::write(temp.path().join(name), b"").unwrap();
        }

        let plugins = PluginScanner::default().scan_directory(temp.path()).unwrap();

        assert_eq!(file_names(&plugins), ["real.asi"]);
    }

    #[test]
    fn test_scan_skips_directories() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("nested.asi")).unwrap();
        fs::write(temp.path().join("plugin.asi"), b"").unwrap();

        let plugins = PluginScanner::default().scan_directory(temp.path()).unwrap();

        assert_eq!(file_names(&plugins), ["plugin.asi"]);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_scan_case_variants_on_case_sensitive_fs() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.asi"), b"").unwrap();
        fs::write(temp.path().join("A.asi"), b"").unwrap();

        let plugins = PluginScanner::default().scan_directory(temp.path()).unwrap();

        assert_eq!(file_names(&plugins), ["A.asi", "a.asi"]);
    }

    #[test]
    fn test_plugin_dir_for_executable() {
        let exe = Path::new("games").join("S4").join("S4_Main.exe");
        let dir = plugin_dir_for(&exe, "plugins");
        assert_eq!(dir, Path::new("games").join("S4").join("plugins"));
    }

    #[test]
    fn test_default_root_is_host_relative() {
        assert_eq!(
            PluginRoot::default(),
            PluginRoot::HostRelative(PathBuf::from("plugins"))
        );
        let dir = PluginRoot::default().resolve().unwrap();
        assert!(dir.ends_with("plugins"));
    }
}
