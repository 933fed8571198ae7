//! Module lifecycle manager
//!
//! Coordinates loading, reloading and unloading of a module against the
//! world. A reload stages the next generation in its own context before the
//! current one is touched, detaches the old generation's components, waits
//! (bounded) for its code to become unreachable and only then commits the new
//! generation and re-attaches scripts. If the old code stays reachable the
//! old generation is reinstated and keeps running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use kiln_kernel::error::KernelError;
use kiln_kernel::{
    ComponentBox, ComponentKind, DispatchReport, Entity, EntityId, EntityReport, HotReloadConfig,
    SystemFailure, SystemManager, SystemScheduler, World, notify_bridge,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::{LoadContext, RetiredContext};
use super::migration::{
    DroppedComponent, MigrationReport, detach_generation, pending_migrations, reattach_all,
    restore_dropped,
};
use super::registry::{RegistryError, TypeRegistry};
use super::source::{DylibSource, ModuleLoadError, ModuleSource};
use super::state::{LifecycleEvent, LifecycleState};
use super::watcher::WatchEvent;

/// Reload error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReloadError {
    #[error("Load error: {0}")]
    Load(#[from] ModuleLoadError),

    #[error("Type not found: {0}")]
    TypeNotFound(String),

    #[error(
        "Generation {generation} still reachable after {waited:?} ({outstanding} references)"
    )]
    UnloadTimeout {
        generation: u64,
        outstanding: usize,
        waited: Duration,
    },

    #[error("Migration to generation {generation} incomplete: {failed} of {attempted} scripts")]
    MigrationPartialFailure {
        generation: u64,
        failed: usize,
        attempted: usize,
    },

    #[error("Another reload is in progress")]
    ConcurrentReloadRejected,

    #[error("Reload cancelled")]
    Cancelled,

    #[error("No module loaded")]
    NotLoaded,

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for ReloadError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::TypeNotFound { name, .. } => ReloadError::TypeNotFound(name),
            other => ReloadError::Internal(other.to_string()),
        }
    }
}

pub type ReloadResult<T> = Result<T, ReloadError>;

/// Outcome of a successful load or reload.
#[derive(Debug, Clone)]
pub struct ReloadReport {
    pub path: PathBuf,
    /// Generation replaced; `None` for a first load.
    pub from_generation: Option<u64>,
    pub generation: u64,
    pub types: usize,
    pub systems_registered: usize,
    pub systems_retired: usize,
    pub detached_scripts: usize,
    pub dropped_components: Vec<DroppedComponent>,
    /// Time spent waiting for the old generation to become unreachable.
    pub unload_wait: Duration,
    pub migration: MigrationReport,
    pub duration: Duration,
}

impl ReloadReport {
    pub fn is_complete(&self) -> bool {
        self.migration.is_complete()
    }

    /// Turn per-entity migration failures into an error.
    pub fn ensure_complete(self) -> ReloadResult<Self> {
        if self.is_complete() {
            return Ok(self);
        }
        let failed = self.migration.failure_count();
        Err(ReloadError::MigrationPartialFailure {
            generation: self.generation,
            failed,
            attempted: self.migration.migrated + failed,
        })
    }
}

/// Outcome of a full unload.
#[derive(Debug, Clone)]
pub struct UnloadReport {
    pub generation: u64,
    pub detached_scripts: usize,
    pub dropped_components: Vec<DroppedComponent>,
    pub systems_retired: usize,
    pub waited: Duration,
}

/// Outcome of one gated tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Entities started for the first time this tick.
    pub started: DispatchReport,
    pub systems: Vec<SystemFailure>,
    pub entities: DispatchReport,
}

impl TickReport {
    pub fn is_ok(&self) -> bool {
        self.started.is_ok() && self.systems.is_empty() && self.entities.is_ok()
    }
}

enum Verification {
    Unloaded(Duration),
    TimedOut(Duration),
    Cancelled(Duration),
}

impl Verification {
    fn waited(&self) -> Duration {
        match self {
            Verification::Unloaded(w) | Verification::TimedOut(w) | Verification::Cancelled(w) => {
                *w
            }
        }
    }
}

struct Staged {
    context: LoadContext,
    registry: Arc<TypeRegistry>,
}

/// Module lifecycle manager
pub struct ModuleLifecycleManager {
    config: HotReloadConfig,
    source: Arc<dyn ModuleSource>,
    world: Arc<World>,
    scheduler: Arc<dyn SystemScheduler>,
    state: RwLock<LifecycleState>,
    /// Current generation
    current: Mutex<Option<LoadContext>>,
    registry: RwLock<Option<Arc<TypeRegistry>>>,
    module_path: RwLock<Option<PathBuf>>,
    /// Last generation released by a reload or unload
    retired: Mutex<Option<Arc<RetiredContext>>>,
    next_generation: AtomicU64,
    /// One reload, load or unload at a time
    reload_slot: tokio::sync::Mutex<()>,
    /// Ticks read, lifecycle transitions write
    gate: Arc<tokio::sync::RwLock<()>>,
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl ModuleLifecycleManager {
    pub fn new(source: Arc<dyn ModuleSource>, config: HotReloadConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            config,
            source,
            world: Arc::new(World::default()),
            scheduler: Arc::new(SystemManager::new()),
            state: RwLock::new(LifecycleState::Idle),
            current: Mutex::new(None),
            registry: RwLock::new(None),
            module_path: RwLock::new(None),
            retired: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            reload_slot: tokio::sync::Mutex::new(()),
            gate: Arc::new(tokio::sync::RwLock::new(())),
            event_tx,
        }
    }

    /// Manager loading native artifacts as configured.
    pub fn from_config(config: HotReloadConfig) -> Self {
        let source = Arc::new(DylibSource::from_config(&config));
        Self::new(source, config)
    }

    pub fn with_world(mut self, world: Arc<World>) -> Self {
        self.world = world;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn SystemScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn config(&self) -> &HotReloadConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Generation of the current module.
    pub fn generation(&self) -> Option<u64> {
        self.current.lock().as_ref().map(LoadContext::generation)
    }

    pub fn is_loaded(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn module_path(&self) -> Option<PathBuf> {
        self.module_path.read().clone()
    }

    /// Registry of the current generation. Holding it keeps that generation
    /// reachable.
    pub fn registry(&self) -> Option<Arc<TypeRegistry>> {
        self.registry.read().clone()
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn scheduler(&self) -> &Arc<dyn SystemScheduler> {
        &self.scheduler
    }

    pub fn retired_generation(&self) -> Option<u64> {
        self.retired.lock().as_ref().map(|r| r.generation())
    }

    /// Entities still waiting for script types no loaded generation defines.
    pub fn pending_migrations(&self) -> Vec<(EntityId, Vec<String>)> {
        pending_migrations(&self.world)
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, to: LifecycleState) {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from != to {
            debug!("Lifecycle state {} -> {}", from, to);
            self.emit(LifecycleEvent::StateChanged { from, to });
        }
    }

    // ========================================================================
    // Load / reload
    // ========================================================================

    /// Load `path`, replacing the current module if one is loaded.
    pub async fn load(&self, path: impl AsRef<Path>) -> ReloadResult<ReloadReport> {
        self.reload_with_cancel(path, CancellationToken::new()).await
    }

    /// Replace the current module with the artifact at `path`. Loads it when
    /// nothing is loaded yet.
    pub async fn reload(&self, path: impl AsRef<Path>) -> ReloadResult<ReloadReport> {
        self.reload_with_cancel(path, CancellationToken::new()).await
    }

    /// [`reload`](Self::reload) that gives up at the next state transition
    /// once `token` is cancelled. Cancellation is honored until the old
    /// generation has been released; after that the reload completes.
    pub async fn reload_with_cancel(
        &self,
        path: impl AsRef<Path>,
        token: CancellationToken,
    ) -> ReloadResult<ReloadReport> {
        let path = path.as_ref().to_path_buf();
        let Ok(_slot) = self.reload_slot.try_lock() else {
            debug!("Rejecting reload of {:?}: another reload is running", path);
            return Err(ReloadError::ConcurrentReloadRejected);
        };
        let _gate = self.gate.write().await;

        if self.is_loaded() {
            self.replace(path, token).await
        } else {
            self.first_load(path, token).await
        }
    }

    async fn stage(&self, path: &Path, generation: u64) -> ReloadResult<Staged> {
        let image = self.source.load(path, generation).await?;
        image.exports.validate()?;
        let context = LoadContext::new(generation, image);
        let registry = Arc::new(TypeRegistry::build(&context));
        Ok(Staged { context, registry })
    }

    /// Install a staged generation as current: register its systems, announce
    /// its script and system types and refresh the scene.
    fn commit(&self, path: &Path, staged: Staged) -> ReloadResult<(Arc<TypeRegistry>, usize)> {
        let Staged { context, registry } = staged;
        let systems = registry.instantiate_systems()?;
        let registered = systems.len();
        for system in systems {
            self.scheduler.register_system(system);
        }

        let generation = context.generation();
        let bridge = self.world.bridge();
        for desc in registry
            .descriptors()
            .iter()
            .filter(|d| d.kind() != ComponentKind::Plain)
        {
            notify_bridge(
                bridge.type_discovered(desc.name(), desc.kind()),
                "type_discovered",
            );
            self.emit(LifecycleEvent::TypeDiscovered {
                generation,
                type_name: desc.name().to_string(),
                kind: desc.kind(),
            });
        }
        notify_bridge(bridge.refresh_scene(), "refresh_scene");

        *self.registry.write() = Some(registry.clone());
        *self.current.lock() = Some(context);
        *self.module_path.write() = Some(path.to_path_buf());
        Ok((registry, registered))
    }

    async fn first_load(&self, path: PathBuf, token: CancellationToken) -> ReloadResult<ReloadReport> {
        let started = Instant::now();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        info!("Loading module {:?} as generation {}", path, generation);
        self.emit(LifecycleEvent::LoadStarted {
            path: path.clone(),
            generation,
        });
        self.set_state(LifecycleState::Loading);

        let staged = match self.stage(&path, generation).await {
            Ok(staged) if !token.is_cancelled() => staged,
            Ok(_) => return Err(self.abort_load(&path, ReloadError::Cancelled)),
            Err(e) => return Err(self.abort_load(&path, e)),
        };
        let types = staged.registry.len();
        let (registry, systems_registered) = match self.commit(&path, staged) {
            Ok(committed) => committed,
            Err(e) => return Err(self.abort_load(&path, e)),
        };

        // Names left behind by an earlier unload.
        let migration = reattach_all(&self.world, &registry, self.config.retain_unresolved);
        self.report_migration_failures(&migration);

        self.set_state(LifecycleState::Active);
        let duration = started.elapsed();
        info!(
            "Loaded {:?} generation {} ({} types) in {:?}",
            path, generation, types, duration
        );
        self.emit(LifecycleEvent::LoadCompleted {
            path: path.clone(),
            generation,
            types,
            duration,
        });
        Ok(ReloadReport {
            path,
            from_generation: None,
            generation,
            types,
            systems_registered,
            systems_retired: 0,
            detached_scripts: 0,
            dropped_components: Vec::new(),
            unload_wait: Duration::ZERO,
            migration,
            duration,
        })
    }

    fn abort_load(&self, path: &Path, error: ReloadError) -> ReloadError {
        error!("Failed to load {:?}: {}", path, error);
        self.set_state(LifecycleState::Idle);
        self.emit(LifecycleEvent::LoadFailed {
            path: path.to_path_buf(),
            error: error.to_string(),
        });
        error
    }

    async fn replace(&self, path: PathBuf, token: CancellationToken) -> ReloadResult<ReloadReport> {
        let started = Instant::now();
        let from_generation = self.generation().ok_or(ReloadError::NotLoaded)?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        info!(
            "Reloading {:?}: generation {} -> {}",
            path, from_generation, generation
        );
        self.emit(LifecycleEvent::ReloadStarted {
            path: path.clone(),
            from_generation,
            generation,
        });

        // Loading: the old generation keeps running until this succeeds.
        self.set_state(LifecycleState::Loading);
        let staged = match self.stage(&path, generation).await {
            Ok(staged) if !token.is_cancelled() => staged,
            Ok(_) => return Err(self.abort_reload(&path, generation, ReloadError::Cancelled)),
            Err(e) => return Err(self.abort_reload(&path, generation, e)),
        };

        // Migrating
        self.set_state(LifecycleState::Migrating);
        let detached = detach_generation(&self.world, from_generation);
        self.emit(LifecycleEvent::ScriptsDetached {
            generation: from_generation,
            scripts: detached.scripts,
            dropped: detached.dropped.len(),
        });
        if token.is_cancelled() {
            if let Some(registry) = self.registry() {
                self.restore_detached(&registry, &detached.dropped);
            }
            return Err(self.abort_reload(&path, generation, ReloadError::Cancelled));
        }

        // Unloading
        self.set_state(LifecycleState::Unloading);
        let (systems_retired, retired) = self.release_current(from_generation)?;

        // Verifying
        self.set_state(LifecycleState::Verifying);
        let outcome = self.wait_unreachable(&retired, &token).await;
        let unload_wait = match self.settle(retired, outcome, &detached.dropped) {
            Ok(waited) => waited,
            Err(e) => {
                drop(staged);
                return Err(self.abort_reload(&path, generation, e));
            }
        };

        // Commit
        let types = staged.registry.len();
        let (registry, systems_registered) = match self.commit(&path, staged) {
            Ok(committed) => committed,
            Err(e) => {
                error!("Generation {} could not be installed: {}", generation, e);
                self.set_state(LifecycleState::Idle);
                self.emit(LifecycleEvent::ReloadFailed {
                    path,
                    generation,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        let migration = reattach_all(&self.world, &registry, self.config.retain_unresolved);
        self.report_migration_failures(&migration);

        self.set_state(LifecycleState::Active);
        let duration = started.elapsed();
        info!(
            "Reloaded {:?} as generation {}: {} scripts migrated, {} failed, in {:?}",
            path,
            generation,
            migration.migrated,
            migration.failure_count(),
            duration
        );
        self.emit(LifecycleEvent::ReloadCompleted {
            path: path.clone(),
            generation,
            migrated: migration.migrated,
            failed: migration.failure_count(),
            duration,
        });
        Ok(ReloadReport {
            path,
            from_generation: Some(from_generation),
            generation,
            types,
            systems_registered,
            systems_retired,
            detached_scripts: detached.scripts,
            dropped_components: detached.dropped,
            unload_wait,
            migration,
            duration,
        })
    }

    fn abort_reload(&self, path: &Path, generation: u64, error: ReloadError) -> ReloadError {
        warn!(
            "Reload of {:?} to generation {} abandoned: {}",
            path, generation, error
        );
        self.set_state(LifecycleState::Active);
        self.emit(LifecycleEvent::ReloadFailed {
            path: path.to_path_buf(),
            generation,
            error: error.to_string(),
        });
        error
    }

    // ========================================================================
    // Unload
    // ========================================================================

    /// Drop the manager's hold on the current generation: revoke it, drop the
    /// registry and retire its systems.
    fn release_current(&self, generation: u64) -> ReloadResult<(usize, Arc<RetiredContext>)> {
        let context = self.current.lock().take().ok_or(ReloadError::NotLoaded)?;
        self.registry.write().take();
        let systems_retired = self.scheduler.retire_generation(generation);
        let retired = context.retire();
        debug!(
            "Generation {} retired, {} references outstanding",
            generation,
            retired.outstanding()
        );
        Ok((systems_retired, Arc::new(retired)))
    }

    async fn wait_unreachable(
        &self,
        retired: &RetiredContext,
        token: &CancellationToken,
    ) -> Verification {
        let started = Instant::now();
        if retired.is_unreachable() {
            return Verification::Unloaded(Duration::ZERO);
        }
        debug!(
            "Waiting for generation {} to become unreachable",
            retired.generation()
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poll = async {
            loop {
                interval.tick().await;
                if retired.is_unreachable() {
                    break;
                }
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Verification::Cancelled(started.elapsed()),
            outcome = tokio::time::timeout(self.config.unload_timeout(), poll) => match outcome {
                Ok(()) => Verification::Unloaded(started.elapsed()),
                Err(_) => Verification::TimedOut(started.elapsed()),
            },
        }
    }

    /// Resolve a verification outcome. A generation still reachable is
    /// reinstated as current with its scripts and `dropped` components
    /// re-attached.
    fn settle(
        &self,
        retired: Arc<RetiredContext>,
        outcome: Verification,
        dropped: &[DroppedComponent],
    ) -> ReloadResult<Duration> {
        let generation = retired.generation();
        let waited = outcome.waited();
        let outstanding = retired.outstanding();
        let revived = match outcome {
            Verification::Unloaded(_) => None,
            // None when released between the last poll and the deadline.
            _ => retired.revive(),
        };
        let Some(context) = revived else {
            info!("Generation {} unloaded after {:?}", generation, waited);
            *self.retired.lock() = Some(retired);
            self.emit(LifecycleEvent::UnloadVerified { generation, waited });
            return Ok(waited);
        };
        self.reinstate(context, dropped);

        match outcome {
            Verification::Cancelled(_) => Err(ReloadError::Cancelled),
            _ => {
                warn!(
                    "Generation {} still has {} references after {:?}, keeping it",
                    generation, outstanding, waited
                );
                self.emit(LifecycleEvent::UnloadTimedOut {
                    generation,
                    outstanding,
                });
                Err(ReloadError::UnloadTimeout {
                    generation,
                    outstanding,
                    waited,
                })
            }
        }
    }

    /// Make a revived generation current again.
    fn reinstate(&self, context: LoadContext, dropped: &[DroppedComponent]) {
        let registry = Arc::new(TypeRegistry::build(&context));
        match registry.instantiate_systems() {
            Ok(systems) => {
                for system in systems {
                    self.scheduler.register_system(system);
                }
            }
            Err(e) => warn!(
                "Cannot restore systems of generation {}: {}",
                context.generation(),
                e
            ),
        }
        *self.registry.write() = Some(registry.clone());
        *self.current.lock() = Some(context);
        let restored = self.restore_detached(&registry, dropped);
        info!(
            "Generation {} reinstated with {} components",
            registry.generation(),
            restored.migrated
        );
        self.set_state(LifecycleState::Active);
    }

    /// Put back what [`detach_generation`] took from the world: recorded
    /// scripts and the dropped non-script components.
    fn restore_detached(
        &self,
        registry: &Arc<TypeRegistry>,
        dropped: &[DroppedComponent],
    ) -> MigrationReport {
        let mut restored = reattach_all(&self.world, registry, true);
        restored.absorb(restore_dropped(&self.world, registry, dropped));
        self.report_migration_failures(&restored);
        restored
    }

    /// Unload the current module completely and return to idle. Script names
    /// stay in the migration lists for the next load.
    pub async fn unload(&self) -> ReloadResult<UnloadReport> {
        let Ok(_slot) = self.reload_slot.try_lock() else {
            return Err(ReloadError::ConcurrentReloadRejected);
        };
        let _gate = self.gate.write().await;
        let generation = self.generation().ok_or(ReloadError::NotLoaded)?;
        info!("Unloading generation {}", generation);

        self.set_state(LifecycleState::Migrating);
        let detached = detach_generation(&self.world, generation);
        self.emit(LifecycleEvent::ScriptsDetached {
            generation,
            scripts: detached.scripts,
            dropped: detached.dropped.len(),
        });

        self.set_state(LifecycleState::Unloading);
        let (systems_retired, retired) = self.release_current(generation)?;

        self.set_state(LifecycleState::Verifying);
        let outcome = self.wait_unreachable(&retired, &CancellationToken::new()).await;
        let waited = self.settle(retired, outcome, &detached.dropped)?;

        *self.module_path.write() = None;
        self.set_state(LifecycleState::Idle);
        Ok(UnloadReport {
            generation,
            detached_scripts: detached.scripts,
            dropped_components: detached.dropped,
            systems_retired,
            waited,
        })
    }

    /// Check that the last retired generation is unreachable, waiting up to
    /// the unload timeout. Has no side effects when it already is.
    pub async fn verify_unloaded(&self) -> ReloadResult<Duration> {
        let retired = self.retired.lock().clone();
        let Some(retired) = retired else {
            return Ok(Duration::ZERO);
        };
        let outcome = self.wait_unreachable(&retired, &CancellationToken::new()).await;
        match outcome {
            Verification::Unloaded(waited) => Ok(waited),
            other => Err(ReloadError::UnloadTimeout {
                generation: retired.generation(),
                outstanding: retired.outstanding(),
                waited: other.waited(),
            }),
        }
    }

    fn report_migration_failures(&self, report: &MigrationReport) {
        for failure in &report.failures {
            self.emit(LifecycleEvent::MigrationFailed {
                entity: failure.entity,
                type_name: failure.type_name.clone(),
                reason: failure.error.to_string(),
            });
        }
    }

    // ========================================================================
    // Runtime
    // ========================================================================

    /// Start new entities, run systems and update every entity once. Never
    /// overlaps a lifecycle transition.
    pub async fn tick(&self, dt: f32) -> ReloadResult<TickReport> {
        let gate = self.gate.clone().read_owned().await;
        let world = self.world.clone();
        let scheduler = self.scheduler.clone();
        tokio::task::spawn_blocking(move || {
            let _gate = gate;
            let started = world.start_all();
            let systems = scheduler.tick(&world, dt);
            let entities = world.update_all(dt);
            TickReport {
                started,
                systems,
                entities,
            }
        })
        .await
        .map_err(|e| ReloadError::Internal(format!("tick task failed: {}", e)))
    }

    /// New instance of `type_name` from the current generation.
    pub fn instantiate(&self, type_name: &str) -> ReloadResult<ComponentBox> {
        let registry = self.registry().ok_or(ReloadError::NotLoaded)?;
        Ok(registry.instantiate(type_name)?)
    }

    pub fn spawn_entity(&self, name: &str) -> ReloadResult<Arc<Entity>> {
        Ok(self.world.spawn(name)?)
    }

    /// Attach a new `type_name` instance to `entity` and apply it right away.
    pub async fn attach(&self, entity: EntityId, type_name: &str) -> ReloadResult<EntityReport> {
        let _gate = self.gate.write().await;
        let target = self
            .world
            .get(entity)
            .ok_or(KernelError::EntityNotFound(entity))?;
        let component = self.instantiate(type_name)?;
        target.add_component(component);
        Ok(target.sync())
    }

    /// Whether the artifact at `path` differs from the current generation.
    pub async fn needs_reload(&self, path: impl AsRef<Path>) -> ReloadResult<bool> {
        let path = path.as_ref();
        let loaded_hash = self.current.lock().as_ref().map(|c| c.hash().to_string());
        let Some(loaded_hash) = loaded_hash else {
            return Ok(true);
        };
        let same_path = self
            .module_path()
            .is_some_and(|current| same_artifact(&current, path));
        if !same_path {
            return Ok(true);
        }
        let fingerprint = self.source.fingerprint(path).await?;
        Ok(fingerprint != loaded_hash)
    }

    /// Reload the current module whenever the watcher reports a change to its
    /// artifact, until `token` is cancelled or the event channel closes.
    pub fn drive_reloads(
        self: Arc<Self>,
        mut events: mpsc::Receiver<WatchEvent>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Reload driver started");
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                self.handle_watch_event(event, &token).await;
            }
            info!("Reload driver stopped");
        })
    }

    async fn handle_watch_event(&self, event: WatchEvent, token: &CancellationToken) {
        let Some(current) = self.module_path() else {
            debug!("No module loaded, ignoring {:?}", event.path);
            return;
        };
        if !same_artifact(&current, &event.path) {
            return;
        }
        if !event.is_change() {
            warn!(
                "Module artifact {:?} removed, keeping generation {:?}",
                current,
                self.generation()
            );
            return;
        }
        match self.needs_reload(&current).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Module artifact {:?} unchanged", current);
                return;
            }
            Err(e) => {
                warn!("Cannot fingerprint {:?}: {}", current, e);
                return;
            }
        }
        match self.reload_with_cancel(&current, token.child_token()).await {
            Ok(report) => info!(
                "Automatic reload of {:?} to generation {} done",
                current, report.generation
            ),
            Err(ReloadError::ConcurrentReloadRejected) => {
                debug!("Reload of {:?} already in progress", current)
            }
            Err(e) => warn!("Automatic reload of {:?} failed: {}", current, e),
        }
    }
}

fn same_artifact(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hot_reload::exports::ModuleExports;
    use crate::hot_reload::migration::MigrationFailure;
    use crate::hot_reload::source::StaticSource;
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

    fn declare(exports: &mut ModuleExports) {
        exports.script::<Orbit>("Orbit");
    }

    fn manager() -> ModuleLifecycleManager {
        let source = StaticSource::new().with_module("game.mod", declare);
        ModuleLifecycleManager::new(Arc::new(source), HotReloadConfig::default())
    }

    #[test]
    fn test_registry_error_mapping() {
        let missing: ReloadError = RegistryError::TypeNotFound {
            name: "Orbit".to_string(),
            generation: 3,
        }
        .into();
        assert!(matches!(missing, ReloadError::TypeNotFound(name) if name == "Orbit"));

        let revoked: ReloadError = RegistryError::ContextRevoked(3).into();
        assert!(matches!(revoked, ReloadError::Internal(_)));
    }

    #[test]
    fn test_ensure_complete() {
        let mut report = ReloadReport {
            path: PathBuf::from("game.mod"),
            from_generation: Some(1),
            generation: 2,
            types: 1,
            systems_registered: 0,
            systems_retired: 0,
            detached_scripts: 2,
            dropped_components: Vec::new(),
            unload_wait: Duration::ZERO,
            migration: MigrationReport {
                generation: 2,
                entities: 2,
                migrated: 2,
                failures: Vec::new(),
            },
            duration: Duration::ZERO,
        };
        assert!(report.clone().ensure_complete().is_ok());

        report.migration.migrated = 1;
        report.migration.failures.push(MigrationFailure {
            entity: EntityId(1),
            type_name: "Orbit".to_string(),
            error: RegistryError::TypeNotFound {
                name: "Orbit".to_string(),
                generation: 2,
            },
        });
        assert!(matches!(
            report.ensure_complete(),
            Err(ReloadError::MigrationPartialFailure {
                generation: 2,
                failed: 1,
                attempted: 2
            })
        ));
    }

    #[test]
    fn test_same_artifact() {
        assert!(same_artifact(Path::new("game.mod"), Path::new("game.mod")));
        assert!(!same_artifact(Path::new("game.mod"), Path::new("other.mod")));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("game.so");
        std::fs::write(&file, b"x").unwrap();
        let dotted = dir.path().join(".").join("game.so");
        assert!(same_artifact(&file, &dotted));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let manager = manager();
        assert_eq!(manager.state(), LifecycleState::Idle);
        assert_eq!(manager.generation(), None);
        assert!(manager.registry().is_none());
        assert!(matches!(
            manager.instantiate("Orbit"),
            Err(ReloadError::NotLoaded)
        ));
        assert!(matches!(manager.unload().await, Err(ReloadError::NotLoaded)));
        assert_eq!(manager.verify_unloaded().await.unwrap(), Duration::ZERO);
        assert!(manager.needs_reload("game.mod").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_emits_state_changes() {
        let manager = manager();
        let mut events = manager.subscribe();

        let report = manager.load("game.mod").await.unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.from_generation, None);
        assert_eq!(manager.state(), LifecycleState::Active);
        assert!(!manager.needs_reload("game.mod").await.unwrap());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let LifecycleEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        assert_eq!(states, vec![LifecycleState::Loading, LifecycleState::Active]);
    }

    #[tokio::test]
    async fn test_unload_returns_to_idle() {
        let manager = manager();
        manager.load("game.mod").await.unwrap();
        let entity = manager.spawn_entity("Planet").unwrap();
        manager.attach(entity.id(), "Orbit").await.unwrap();

        let report = manager.unload().await.unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.detached_scripts, 1);
        assert_eq!(manager.state(), LifecycleState::Idle);
        assert_eq!(manager.retired_generation(), Some(1));
        assert_eq!(
            manager.pending_migrations(),
            vec![(entity.id(), vec!["Orbit".to_string()])]
        );

        // The next load picks the recorded script up again.
        let report = manager.load("game.mod").await.unwrap();
        assert_eq!(report.generation, 2);
        assert_eq!(report.migration.migrated, 1);
        let cell = entity.get_component("Orbit").unwrap();
        assert_eq!(cell.lock().generation(), Some(2));
    }
}
