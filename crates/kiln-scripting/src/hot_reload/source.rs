//! Module sources
//!
//! Resolve a module path into its declared exports. Native modules are shared
//! libraries opened through `libloading`; in-process modules are plain
//! declare functions registered by path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use libloading::{Library, Symbol};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::exports::{API_VERSION_SYMBOL, DECLARE_SYMBOL, MODULE_API_VERSION, ModuleExports};

/// Module load error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ModuleLoadError {
    #[error("Failed to load library: {0}")]
    LibraryLoad(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Module exports no types")]
    EmptyModule,

    #[error("Type exported twice: {0}")]
    DuplicateExport(String),

    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for module sources
pub type ModuleLoadResult<T> = Result<T, ModuleLoadError>;

/// A native library opened for one generation.
///
/// Closing the library is followed by removal of its shadow copy.
pub struct LoadedLibrary {
    library: Option<Library>,
    shadow: Option<PathBuf>,
}

impl LoadedLibrary {
    pub fn new(library: Library, shadow: Option<PathBuf>) -> Self {
        Self {
            library: Some(library),
            shadow,
        }
    }

    pub fn shadow_path(&self) -> Option<&Path> {
        self.shadow.as_deref()
    }
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            if let Err(e) = library.close() {
                warn!("Failed to close module library: {}", e);
            }
        }
        if let Some(shadow) = self.shadow.take() {
            debug!("Removing shadow copy {:?}", shadow);
            let _ = std::fs::remove_file(shadow);
        }
    }
}

/// A resolved module, ready to be owned by a load context.
pub struct ModuleImage {
    pub exports: ModuleExports,
    /// Native code backing the exports, if any.
    pub library: Option<LoadedLibrary>,
    /// Content fingerprint of the artifact.
    pub hash: String,
    pub origin: PathBuf,
}

/// Resolves module paths into exports.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// Load `path` for `generation`. Every call must produce code that is
    /// independent of earlier generations.
    async fn load(&self, path: &Path, generation: u64) -> ModuleLoadResult<ModuleImage>;

    /// Content fingerprint used to skip reloading an unchanged artifact.
    async fn fingerprint(&self, path: &Path) -> ModuleLoadResult<String>;
}

/// Calculate a SHA-256 file hash
pub fn calculate_hash(path: &Path) -> ModuleLoadResult<String> {
    let contents = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// Native modules
// ============================================================================

/// Loads `cdylib` modules declared with [`declare_module!`](crate::declare_module).
///
/// The dynamic loader hands back the already-open handle when the same path
/// is opened twice, so each generation is loaded from its own copy
/// `<shadow_dir>/<stem>-g<N>.<ext>`. That also leaves the original artifact
/// free to be overwritten by the next build.
pub struct DylibSource {
    shadow_dir: PathBuf,
    verify_api_version: bool,
    api_version: u32,
}

impl DylibSource {
    pub fn new(shadow_dir: impl Into<PathBuf>) -> Self {
        Self {
            shadow_dir: shadow_dir.into(),
            verify_api_version: true,
            api_version: MODULE_API_VERSION,
        }
    }

    pub fn from_config(config: &kiln_kernel::HotReloadConfig) -> Self {
        Self::new(config.shadow_dir()).with_api_version_check(config.verify_api_version)
    }

    pub fn with_api_version_check(mut self, enabled: bool) -> Self {
        self.verify_api_version = enabled;
        self
    }

    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }

    /// Per-generation copy location for `path`.
    pub fn shadow_path(&self, path: &Path, generation: u64) -> PathBuf {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module");
        let name = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}-g{}.{}", stem, generation, ext),
            None => format!("{}-g{}", stem, generation),
        };
        self.shadow_dir.join(name)
    }

    fn open(&self, shadow: &Path) -> ModuleLoadResult<(Library, ModuleExports)> {
        // Safety: opening a library runs its initializers. Module artifacts
        // are trusted code built against this crate.
        let library = unsafe {
            Library::new(shadow).map_err(|e| ModuleLoadError::LibraryLoad(e.to_string()))?
        };

        let api_version = unsafe {
            let version_fn: Symbol<unsafe extern "C" fn() -> u32> =
                library.get(API_VERSION_SYMBOL).map_err(|e| {
                    ModuleLoadError::SymbolNotFound(format!("_kiln_module_api_version: {}", e))
                })?;
            version_fn()
        };

        if self.verify_api_version && api_version != self.api_version {
            return Err(ModuleLoadError::VersionMismatch {
                expected: self.api_version,
                actual: api_version,
            });
        }

        let mut exports = ModuleExports::new();
        unsafe {
            #[allow(improper_ctypes_definitions)]
            let declare_fn: Symbol<unsafe extern "C" fn(&mut ModuleExports)> = library
                .get(DECLARE_SYMBOL)
                .map_err(|e| {
                    ModuleLoadError::SymbolNotFound(format!("_kiln_module_declare: {}", e))
                })?;
            declare_fn(&mut exports);
        }
        Ok((library, exports))
    }
}

#[async_trait]
impl ModuleSource for DylibSource {
    async fn load(&self, path: &Path, generation: u64) -> ModuleLoadResult<ModuleImage> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ModuleLoadError::NotFound(path.display().to_string()));
        }

        let hash = calculate_hash(path)?;
        tokio::fs::create_dir_all(&self.shadow_dir).await?;
        let shadow = self.shadow_path(path, generation);
        tokio::fs::copy(path, &shadow).await?;
        info!("Loading module {:?} (generation {}) from {:?}", path, generation, shadow);

        match self.open(&shadow) {
            Ok((library, exports)) => Ok(ModuleImage {
                exports,
                library: Some(LoadedLibrary::new(library, Some(shadow))),
                hash,
                origin: path.to_path_buf(),
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&shadow).await;
                Err(e)
            }
        }
    }

    async fn fingerprint(&self, path: &Path) -> ModuleLoadResult<String> {
        calculate_hash(path)
    }
}

// ============================================================================
// In-process modules
// ============================================================================

type Declare = Arc<dyn Fn(&mut ModuleExports) + Send + Sync>;

/// Modules compiled into the host, keyed by a virtual path.
///
/// Registering a new declare function under an existing path stands in for
/// rebuilding the artifact.
#[derive(Default)]
pub struct StaticSource {
    modules: RwLock<HashMap<PathBuf, (u64, Declare)>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module<F>(self, path: impl Into<PathBuf>, declare: F) -> Self
    where
        F: Fn(&mut ModuleExports) + Send + Sync + 'static,
    {
        self.register(path, declare);
        self
    }

    /// Register or replace the module at `path`.
    pub fn register<F>(&self, path: impl Into<PathBuf>, declare: F)
    where
        F: Fn(&mut ModuleExports) + Send + Sync + 'static,
    {
        let mut modules = self.modules.write();
        let path = path.into();
        let revision = modules.get(&path).map(|(r, _)| r + 1).unwrap_or(0);
        modules.insert(path, (revision, Arc::new(declare)));
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.modules.write().remove(path).is_some()
    }

    fn lookup(&self, path: &Path) -> ModuleLoadResult<(u64, Declare)> {
        self.modules
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ModuleLoadError::NotFound(path.display().to_string()))
    }

    fn hash_of(path: &Path, revision: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(revision.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl ModuleSource for StaticSource {
    async fn load(&self, path: &Path, generation: u64) -> ModuleLoadResult<ModuleImage> {
        let (revision, declare) = self.lookup(path)?;
        debug!("Declaring static module {:?} (generation {})", path, generation);
        let mut exports = ModuleExports::new();
        declare(&mut exports);
        Ok(ModuleImage {
            exports,
            library: None,
            hash: Self::hash_of(path, revision),
            origin: path.to_path_buf(),
        })
    }

    async fn fingerprint(&self, path: &Path) -> ModuleLoadResult<String> {
        let (revision, _) = self.lookup(path)?;
        Ok(Self::hash_of(path, revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_kernel::Component;
    use std::any::Any;

    #[derive(Default)]
    struct Orbit;

    impl Component for Orbit {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_calculate_hash() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("module.so");
        std::fs::write(&file_path, b"module bytes").unwrap();

        let hash1 = calculate_hash(&file_path).unwrap();
        let hash2 = calculate_hash(&file_path).unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);

        std::fs::write(&file_path, b"rebuilt module bytes").unwrap();
        assert_ne!(calculate_hash(&file_path).unwrap(), hash1);
    }

    #[test]
    fn test_shadow_path_per_generation() {
        let source = DylibSource::new("/tmp/shadow");
        assert_eq!(
            source.shadow_path(Path::new("/build/libgame.so"), 3),
            PathBuf::from("/tmp/shadow/libgame-g3.so")
        );
        assert_eq!(
            source.shadow_path(Path::new("/build/game"), 1),
            PathBuf::from("/tmp/shadow/game-g1")
        );
    }

    #[tokio::test]
    async fn test_dylib_missing_artifact() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = DylibSource::new(temp_dir.path().join("shadow"));
        let result = source.load(&temp_dir.path().join("absent.so"), 1).await;
        assert!(matches!(result, Err(ModuleLoadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_dylib_invalid_artifact_leaves_no_shadow() {
        let temp_dir = tempfile::tempdir().unwrap();
        let artifact = temp_dir.path().join("libbroken.so");
        std::fs::write(&artifact, b"not a shared library").unwrap();
        let source = DylibSource::new(temp_dir.path().join("shadow"));

        let result = source.load(&artifact, 1).await;
        assert!(matches!(result, Err(ModuleLoadError::LibraryLoad(_))));
        assert!(!source.shadow_path(&artifact, 1).exists());
    }

    #[tokio::test]
    async fn test_static_source_revisions() {
        let source = StaticSource::new().with_module("game.mod", |exports| {
            exports.script::<Orbit>("Orbit");
        });
        let path = Path::new("game.mod");

        let first = source.load(path, 1).await.unwrap();
        assert_eq!(first.exports.len(), 1);
        assert!(first.library.is_none());
        assert_eq!(source.fingerprint(path).await.unwrap(), first.hash);

        source.register("game.mod", |_| {});
        assert_ne!(source.fingerprint(path).await.unwrap(), first.hash);
        assert!(source.load(path, 2).await.unwrap().exports.is_empty());

        assert!(source.remove(path));
        assert!(matches!(
            source.load(path, 3).await,
            Err(ModuleLoadError::NotFound(_))
        ));
    }
}
