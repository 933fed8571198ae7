//! Scheduled systems
//!
//! Systems are module-defined behaviors that run once per tick against the
//! whole world instead of being attached to an entity.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entity::panic_message;
use crate::error::{ComponentError, ComponentResult};
use crate::lease::Lease;
use crate::world::World;

/// 系统优先级（用于确定执行顺序）
/// System priority (higher runs first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum SystemPriority {
    Low = 0,
    #[default]
    Normal = 50,
    High = 100,
    Critical = 200,
}

/// 核心系统 trait
/// Core system trait
pub trait System: Any + Send {
    fn priority(&self) -> SystemPriority {
        SystemPriority::Normal
    }

    fn update(&mut self, world: &World, dt: f32) -> ComponentResult<()>;

    fn as_any(&self) -> &dyn Any;
}

/// An owned system instance with its name and code lease.
pub struct SystemBox {
    instance: Box<dyn System>,
    name: String,
    lease: Option<Lease>,
}

impl SystemBox {
    pub fn new(name: &str, instance: Box<dyn System>) -> Self {
        Self {
            instance,
            name: name.to_string(),
            lease: None,
        }
    }

    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> SystemPriority {
        self.instance.priority()
    }

    pub fn generation(&self) -> Option<u64> {
        self.lease.as_ref().map(Lease::generation)
    }

    pub fn downcast_ref<T: System>(&self) -> Option<&T> {
        self.instance.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for SystemBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemBox")
            .field("name", &self.name)
            .field("priority", &self.priority())
            .field("generation", &self.generation())
            .finish()
    }
}

/// A system that failed during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFailure {
    pub system: String,
    pub error: ComponentError,
}

/// Scheduler collaborator that owns registered systems.
pub trait SystemScheduler: Send + Sync {
    /// Register a system, replacing any system with the same name.
    fn register_system(&self, system: SystemBox);

    /// Drop every system whose code belongs to `generation`. Returns how many
    /// were removed.
    fn retire_generation(&self, generation: u64) -> usize;

    fn system_names(&self) -> Vec<String>;

    /// Run every system once.
    fn tick(&self, world: &World, dt: f32) -> Vec<SystemFailure>;
}

/// Default scheduler: runs systems sequentially by descending priority.
#[derive(Default)]
pub struct SystemManager {
    systems: Mutex<Vec<SystemBox>>,
}

impl SystemManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.systems.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.lock().is_empty()
    }
}

impl SystemScheduler for SystemManager {
    fn register_system(&self, system: SystemBox) {
        let mut systems = self.systems.lock();
        systems.retain(|s| s.name != system.name);
        info!(
            "Registering system {} ({:?})",
            system.name,
            system.priority()
        );
        systems.push(system);
        // Stable sort keeps registration order within a priority.
        systems.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    fn retire_generation(&self, generation: u64) -> usize {
        let mut systems = self.systems.lock();
        let before = systems.len();
        systems.retain(|s| s.generation() != Some(generation));
        let removed = before - systems.len();
        debug!("Retired {} systems of generation {}", removed, generation);
        removed
    }

    fn system_names(&self) -> Vec<String> {
        self.systems.lock().iter().map(|s| s.name.clone()).collect()
    }

    fn tick(&self, world: &World, dt: f32) -> Vec<SystemFailure> {
        let mut failures = Vec::new();
        let mut systems = self.systems.lock();
        for system in systems.iter_mut() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                system.instance.update(world, dt)
            }));
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(payload) => ComponentError::Panicked(panic_message(payload.as_ref())),
            };
            warn!("System {} failed: {}", system.name, error);
            failures.push(SystemFailure {
                system: system.name.clone(),
                error,
            });
        }
        failures
    }
}
