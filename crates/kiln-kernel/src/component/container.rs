//! Per-entity component container
//!
//! Maps a type name to one live component. Mutations are staged and only
//! applied at an explicit sync point; the live table is an immutable snapshot
//! swapped whole, so readers iterating a snapshot never observe a partial
//! sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{ComponentBox, ComponentInfo, ComponentKind};
use crate::error::{KernelError, KernelResult};

/// Shared handle to a live component.
pub type ComponentCell = Arc<Mutex<ComponentBox>>;

#[derive(Clone)]
struct Slot {
    name: Arc<str>,
    info: ComponentInfo,
    enabled: Arc<AtomicBool>,
    cell: ComponentCell,
}

#[derive(Default)]
struct LiveTable {
    slots: Vec<Slot>,
    index: HashMap<Arc<str>, usize>,
}

impl LiveTable {
    fn from_slots(slots: Vec<Slot>) -> Self {
        let index = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.name.clone(), i))
            .collect();
        Self { slots, index }
    }

    fn get(&self, name: &str) -> Option<&Slot> {
        self.index.get(name).map(|&i| &self.slots[i])
    }
}

#[derive(Default)]
struct Staging {
    additions: Vec<(String, ComponentBox)>,
    /// Pending removals and whether the native side should be told.
    removals: HashMap<String, bool>,
}

impl Staging {
    fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// What a [`ComponentsContainer::sync`] applied.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Removed names and whether the removal should be reported to the bridge.
    pub removed: Vec<(String, bool)>,
    /// Cells added by this sync, in insertion order.
    pub added: Vec<(String, ComponentCell)>,
    /// Names whose live component was replaced by a staged addition.
    pub replaced: Vec<String>,
}

impl SyncOutcome {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Immutable view of the live mapping at one point in time.
#[derive(Clone)]
pub struct ContainerSnapshot {
    table: Arc<LiveTable>,
}

impl ContainerSnapshot {
    pub fn len(&self) -> usize {
        self.table.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.slots.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.table.slots.iter().map(|s| s.name.to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<ComponentCell> {
        self.table.get(name).map(|s| s.cell.clone())
    }

    /// Cells in insertion order at the time of the snapshot.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &ComponentCell)> {
        self.table.slots.iter().map(|s| (&*s.name, &s.cell))
    }
}

/// Type-name keyed component storage with deferred mutation.
pub struct ComponentsContainer {
    live: RwLock<Arc<LiveTable>>,
    staging: Mutex<Staging>,
    migration: Mutex<Vec<String>>,
    owner_active: Arc<AtomicBool>,
}

impl ComponentsContainer {
    /// Create a container whose [`active_values`](Self::active_values) follows
    /// the owner's active flag.
    pub fn new(owner_active: Arc<AtomicBool>) -> Self {
        Self {
            live: RwLock::new(Arc::new(LiveTable::default())),
            staging: Mutex::new(Staging::default()),
            migration: Mutex::new(Vec::new()),
            owner_active,
        }
    }

    pub fn get(&self, name: &str) -> Option<ComponentCell> {
        self.live.read().get(name).map(|s| s.cell.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.live.read().index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.live.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.read().slots.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().names()
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            table: self.live.read().clone(),
        }
    }

    /// Record a deferred addition. A later addition under the same name
    /// supersedes an earlier one.
    pub fn stage_add(&self, name: &str, component: ComponentBox) {
        let mut staging = self.staging.lock();
        staging.additions.retain(|(n, _)| n != name);
        staging.additions.push((name.to_string(), component));
        trace!("Staged addition of {}", name);
    }

    /// Record a deferred removal. Removing a name with a pending addition
    /// cancels both.
    pub fn stage_remove(&self, name: &str, notify: bool) {
        let mut staging = self.staging.lock();
        let before = staging.additions.len();
        staging.additions.retain(|(n, _)| n != name);
        if staging.additions.len() != before {
            trace!("Removal of {} cancelled its pending addition", name);
            return;
        }
        staging.removals.insert(name.to_string(), notify);
    }

    pub fn has_pending(&self) -> bool {
        !self.staging.lock().is_empty()
    }

    /// Apply staged removals then additions and swap in the new live table.
    pub fn sync(&self) -> SyncOutcome {
        let staged = std::mem::take(&mut *self.staging.lock());
        if staged.is_empty() {
            return SyncOutcome::default();
        }

        let mut outcome = SyncOutcome::default();
        let mut live = self.live.write();
        let mut slots = live.slots.clone();

        for (name, notify) in staged.removals {
            let before = slots.len();
            slots.retain(|s| *s.name != *name);
            if slots.len() != before {
                outcome.removed.push((name, notify));
            }
        }

        for (name, component) in staged.additions {
            let before = slots.len();
            slots.retain(|s| *s.name != *name);
            if slots.len() != before {
                outcome.replaced.push(name.clone());
            }
            let slot = Slot {
                name: Arc::from(name.as_str()),
                info: component.info().clone(),
                enabled: Arc::new(AtomicBool::new(true)),
                cell: Arc::new(Mutex::new(component)),
            };
            outcome.added.push((name, slot.cell.clone()));
            slots.push(slot);
        }

        *live = Arc::new(LiveTable::from_slots(slots));
        debug!(
            "Container sync: {} removed, {} added, {} replaced",
            outcome.removed.len(),
            outcome.added.len(),
            outcome.replaced.len()
        );
        outcome
    }

    /// Enabled components, or nothing when the owning entity is inactive.
    pub fn active_values(&self) -> Vec<ComponentCell> {
        if !self.owner_active.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.live
            .read()
            .slots
            .iter()
            .filter(|s| s.enabled.load(Ordering::Acquire))
            .map(|s| s.cell.clone())
            .collect()
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.live.read().get(name) {
            Some(slot) => {
                slot.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.live
            .read()
            .get(name)
            .map(|s| s.enabled.load(Ordering::Acquire))
    }

    /// Remove a live component immediately and hand back ownership.
    ///
    /// Returns `Ok(None)` when no live component has that name, and fails with
    /// [`KernelError::ComponentBusy`] while a snapshot or cell handle is still
    /// held. Nothing is removed in that case.
    pub fn take_now(&self, name: &str) -> KernelResult<Option<ComponentBox>> {
        let mut live = self.live.write();
        let Some(&pos) = live.index.get(name) else {
            return Ok(None);
        };
        // An outstanding snapshot or handle would keep the instance alive.
        if Arc::strong_count(&*live) > 1 || Arc::strong_count(&live.slots[pos].cell) > 1 {
            return Err(KernelError::ComponentBusy(name.to_string()));
        }
        let mut slots = live.slots.clone();
        let slot = slots.remove(pos);
        *live = Arc::new(LiveTable::from_slots(slots));
        drop(live);

        Arc::try_unwrap(slot.cell)
            .map(|cell| Some(cell.into_inner()))
            .map_err(|_| KernelError::ComponentBusy(name.to_string()))
    }

    /// Drop every live or staged component whose code belongs to
    /// `generation`.
    ///
    /// Script names are appended to the migration list; the names of every
    /// detached component are returned with their kind.
    pub fn detach_generation(&self, generation: u64) -> Vec<(String, ComponentKind)> {
        let mut detached = Vec::new();

        let staged: Vec<ComponentBox> = {
            let mut staging = self.staging.lock();
            let (owned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut staging.additions)
                .into_iter()
                .partition(|(_, c)| c.generation() == Some(generation));
            staging.additions = kept;
            owned.into_iter().map(|(_, c)| c).collect()
        };
        for component in staged {
            detached.push((component.type_name().to_string(), component.kind()));
        }

        {
            let mut live = self.live.write();
            let (owned, kept): (Vec<Slot>, Vec<Slot>) = live
                .slots
                .iter()
                .cloned()
                .partition(|s| s.cell.lock().generation() == Some(generation));
            if !owned.is_empty() {
                *live = Arc::new(LiveTable::from_slots(kept));
            }
            for slot in owned {
                detached.push((slot.name.to_string(), slot.info.kind));
            }
        }

        let mut migration = self.migration.lock();
        for (name, kind) in &detached {
            if *kind == ComponentKind::Script && !migration.contains(name) {
                migration.push(name.clone());
            }
        }
        detached
    }

    pub fn record_migration(&self, name: &str) {
        let mut migration = self.migration.lock();
        if !migration.iter().any(|n| n == name) {
            migration.push(name.to_string());
        }
    }

    pub fn migration_list(&self) -> Vec<String> {
        self.migration.lock().clone()
    }

    /// Keep only the migration entries for which `keep` returns true.
    pub fn retain_migration(&self, mut keep: impl FnMut(&str) -> bool) {
        self.migration.lock().retain(|n| keep(n));
    }

    pub fn clear_migration(&self) {
        self.migration.lock().clear();
    }

    /// Drop every live and staged component and forget the migration list.
    ///
    /// Returns the names of the dropped components, live ones first. Their
    /// instances go away once no snapshot or cell handle refers to them.
    pub fn clear(&self) -> Vec<(String, ComponentKind)> {
        let staged = std::mem::take(&mut *self.staging.lock());
        let live = std::mem::take(&mut *self.live.write());
        self.migration.lock().clear();

        let mut cleared: Vec<(String, ComponentKind)> = live
            .slots
            .iter()
            .map(|s| (s.name.to_string(), s.info.kind))
            .collect();
        cleared.extend(
            staged
                .additions
                .iter()
                .map(|(name, component)| (name.clone(), component.kind())),
        );
        debug!("Container cleared: {} components dropped", cleared.len());
        cleared
    }
}
