//! Load contexts
//!
//! A load context exclusively owns one module generation: its type exports,
//! its static resources and the native code behind them. Every instance built
//! from the context holds a [`Lease`] on it, so the code stays mapped until the
//! last instance, system and registry referring to it is gone.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use kiln_kernel::{CodeOwner, ComponentKind, Lease};
use tracing::{debug, info};

use super::exports::TypeExport;
use super::source::{LoadedLibrary, ModuleImage};

/// Shared owner of one generation. Field order is drop order: exports and
/// resources go before the library that defines them.
pub struct ContextShared {
    generation: u64,
    origin: PathBuf,
    revoked: AtomicBool,
    types: Vec<TypeExport>,
    resources: Vec<Box<dyn Any + Send + Sync>>,
    library: Option<LoadedLibrary>,
}

impl ContextShared {
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub(crate) fn types(&self) -> &[TypeExport] {
        &self.types
    }

    /// First resource of type `T` handed over by the module.
    pub fn resource<T: Any>(&self) -> Option<&T> {
        self.resources.iter().find_map(|r| r.downcast_ref::<T>())
    }

    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }
}

impl CodeOwner for ContextShared {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn origin(&self) -> &Path {
        &self.origin
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        debug!(
            "Generation {} of {:?} released",
            self.generation, self.origin
        );
    }
}

/// The manager's handle on the current generation.
pub struct LoadContext {
    shared: Arc<ContextShared>,
    hash: String,
    loaded_at: Instant,
}

impl LoadContext {
    /// Take ownership of a resolved module image as `generation`.
    pub fn new(generation: u64, image: ModuleImage) -> Self {
        let ModuleImage {
            exports,
            library,
            hash,
            origin,
        } = image;
        let (types, resources) = exports.into_parts();
        info!(
            "Load context for generation {} created with {} types",
            generation,
            types.len()
        );
        Self {
            shared: Arc::new(ContextShared {
                generation,
                origin,
                revoked: AtomicBool::new(false),
                types,
                resources,
                library,
            }),
            hash,
            loaded_at: Instant::now(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn origin(&self) -> &Path {
        &self.shared.origin
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    pub fn lease(&self) -> Lease {
        Lease::new(self.shared.clone())
    }

    /// Number of live leases plus the context's own reference.
    pub fn outstanding(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub fn is_revoked(&self) -> bool {
        self.shared.is_revoked()
    }

    pub fn type_names(&self) -> Vec<(&str, ComponentKind)> {
        self.shared
            .types
            .iter()
            .map(|t| (t.name(), t.kind()))
            .collect()
    }

    /// Refuse any further instantiation from this generation.
    pub fn revoke(&self) {
        self.shared.revoked.store(true, Ordering::Release);
    }

    /// Give up the strong reference, keeping only a way to observe (and if
    /// needed revive) the generation.
    pub fn retire(self) -> RetiredContext {
        self.revoke();
        let retired = RetiredContext {
            weak: Arc::downgrade(&self.shared),
            generation: self.shared.generation,
            origin: self.shared.origin.clone(),
            hash: self.hash,
            loaded_at: self.loaded_at,
            retired_at: Instant::now(),
        };
        drop(self.shared);
        retired
    }
}

/// A generation whose unload was requested.
pub struct RetiredContext {
    weak: Weak<ContextShared>,
    generation: u64,
    origin: PathBuf,
    hash: String,
    loaded_at: Instant,
    retired_at: Instant,
}

impl RetiredContext {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn retired_at(&self) -> Instant {
        self.retired_at
    }

    /// No instance, system or registry refers to the generation any more.
    pub fn is_unreachable(&self) -> bool {
        self.weak.strong_count() == 0
    }

    /// Strong references still keeping the generation alive.
    pub fn outstanding(&self) -> usize {
        self.weak.strong_count()
    }

    /// Turn the retired generation back into a current one. Returns `None`
    /// when it has already become unreachable.
    pub fn revive(&self) -> Option<LoadContext> {
        let shared = self.weak.upgrade()?;
        shared.revoked.store(false, Ordering::Release);
        info!("Reviving generation {} of {:?}", self.generation, self.origin);
        Some(LoadContext {
            shared,
            hash: self.hash.clone(),
            loaded_at: self.loaded_at,
        })
    }
}
