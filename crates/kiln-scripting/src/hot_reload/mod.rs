//! Hot-reload module support
//!
//! Provides the module hot-reload lifecycle:
//! - Module exports and the `declare_module!` entry points
//! - Isolated per-generation load contexts with code leases
//! - Script migration across generations
//! - Bounded unload verification with rollback
//! - Artifact watching

mod context;
mod exports;
mod manager;
mod migration;
mod registry;
mod source;
mod state;
mod watcher;

pub use context::{ContextShared, LoadContext, RetiredContext};
pub use exports::{
    API_VERSION_SYMBOL, ComponentCtor, DECLARE_SYMBOL, DeclareFn, MODULE_API_VERSION,
    ModuleExports, SystemCtor, TypeExport,
};
pub use manager::{
    ModuleLifecycleManager, ReloadError, ReloadReport, ReloadResult, TickReport, UnloadReport,
};
pub use migration::{
    DetachSummary, DroppedComponent, MigrationFailure, MigrationReport, detach_generation,
    pending_migrations, reattach_all,
};
pub use registry::{RegistryError, RegistryResult, TypeDescriptor, TypeRegistry};
pub use source::{
    DylibSource, LoadedLibrary, ModuleImage, ModuleLoadError, ModuleLoadResult, ModuleSource,
    StaticSource, calculate_hash,
};
pub use state::{LifecycleEvent, LifecycleState};
pub use watcher::{ModuleWatcher, WatchConfig, WatchEvent, WatchEventKind};
