//! Entities and per-entity lifecycle dispatch

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bridge::{NativeBridge, log_bridge_failure};
use crate::component::{
    ComponentBox, ComponentCell, ComponentContext, ComponentKind, ComponentsContainer,
};
use crate::error::{ComponentError, ComponentResult, KernelResult};

/// Integer entity identifier shared with the native side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub i32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque collision/layer filter forwarded to the native side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityFilter(pub i32);

/// A single hook failure on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFailure {
    pub component: String,
    pub error: ComponentError,
}

/// Result of dispatching one hook to every component of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityReport {
    pub entity: EntityId,
    /// Number of components the hook was invoked on.
    pub invoked: usize,
    pub failures: Vec<ComponentFailure>,
}

impl EntityReport {
    fn new(entity: EntityId) -> Self {
        Self {
            entity,
            invoked: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Copy)]
enum Hook {
    Start,
    Update(f32),
    Collision(EntityId),
}

/// An object in the world carrying a set of components.
pub struct Entity {
    id: EntityId,
    name: String,
    filter: EntityFilter,
    parent: RwLock<Option<EntityId>>,
    children: RwLock<Vec<EntityId>>,
    components: ComponentsContainer,
    initialized: AtomicBool,
    active: Arc<AtomicBool>,
    released: AtomicBool,
    bridge: Arc<dyn NativeBridge>,
}

impl Entity {
    pub fn new(
        id: EntityId,
        name: &str,
        filter: EntityFilter,
        bridge: Arc<dyn NativeBridge>,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        Self {
            id,
            name: name.to_string(),
            filter,
            parent: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            components: ComponentsContainer::new(active.clone()),
            initialized: AtomicBool::new(false),
            active,
            released: AtomicBool::new(false),
            bridge,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> EntityFilter {
        self.filter
    }

    pub fn bridge(&self) -> &Arc<dyn NativeBridge> {
        &self.bridge
    }

    pub fn components(&self) -> &ComponentsContainer {
        &self.components
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        log_bridge_failure(self.bridge.set_active(self.id, active), "set_active");
    }

    /// The entity was released from its world; it holds no components and
    /// refuses new ones.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Drop every component this entity holds and refuse further attachments.
    ///
    /// Handles to a released entity may outlive it; its components must not,
    /// or they would keep their module generation reachable.
    pub(crate) fn release_components(&self) -> usize {
        self.released.store(true, Ordering::Release);
        self.active.store(false, Ordering::Release);
        let cleared = self.components.clear();
        for (name, _) in &cleared {
            log_bridge_failure(
                self.bridge.component_detached(self.id, name),
                "component_detached",
            );
        }
        cleared.len()
    }

    pub fn parent(&self) -> Option<EntityId> {
        *self.parent.read()
    }

    pub(crate) fn set_parent(&self, parent: Option<EntityId>) {
        *self.parent.write() = parent;
    }

    pub fn children(&self) -> Vec<EntityId> {
        self.children.read().clone()
    }

    pub fn add_child(&self, child: EntityId) {
        let mut children = self.children.write();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn remove_child(&self, child: EntityId) {
        self.children.write().retain(|c| *c != child);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Mark the entity initialized, apply pending mutations and start every
    /// component.
    pub fn start(&self) -> EntityReport {
        self.initialized.store(true, Ordering::Release);
        let mut report = EntityReport::new(self.id);
        // Components added by this sync are started by the loop below.
        self.apply_sync(&mut report, false);
        let snapshot = self.components.snapshot();
        for (name, cell) in snapshot.cells() {
            self.invoke(name, cell, Hook::Start, &mut report);
        }
        report
    }

    /// Update every component over a fixed snapshot, then sync.
    pub fn update(&self, dt: f32) -> EntityReport {
        let mut report = EntityReport::new(self.id);
        let snapshot = self.components.snapshot();
        for (name, cell) in snapshot.cells() {
            self.invoke(name, cell, Hook::Update(dt), &mut report);
        }
        drop(snapshot);
        self.apply_sync(&mut report, true);
        report
    }

    /// Deliver a collision against `other` to every component.
    pub fn on_collision(&self, other: EntityId) -> EntityReport {
        let mut report = EntityReport::new(self.id);
        let snapshot = self.components.snapshot();
        for (name, cell) in snapshot.cells() {
            self.invoke(name, cell, Hook::Collision(other), &mut report);
        }
        report
    }

    /// Apply pending container mutations outside of a dispatch pass.
    pub fn sync(&self) -> EntityReport {
        let mut report = EntityReport::new(self.id);
        self.apply_sync(&mut report, true);
        report
    }

    fn apply_sync(&self, report: &mut EntityReport, start_added: bool) {
        let outcome = self.components.sync();
        for (name, notify) in &outcome.removed {
            if *notify {
                log_bridge_failure(
                    self.bridge.component_detached(self.id, name),
                    "component_detached",
                );
            }
        }
        if start_added && self.is_initialized() {
            for (name, cell) in &outcome.added {
                self.invoke(name, cell, Hook::Start, report);
            }
        }
    }

    fn invoke(&self, name: &str, cell: &ComponentCell, hook: Hook, report: &mut EntityReport) {
        report.invoked += 1;
        let result = panic::catch_unwind(AssertUnwindSafe(|| -> ComponentResult<()> {
            let mut component = cell.lock();
            let mut ctx = ComponentContext::new(self);
            let instance = component.instance_mut();
            match hook {
                Hook::Start => instance.start(&mut ctx),
                Hook::Update(dt) => instance.update(&mut ctx, dt),
                Hook::Collision(other) => instance.on_collision(&mut ctx, other),
            }
        }));

        let error = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => ComponentError::Panicked(panic_message(payload.as_ref())),
        };
        warn!("{} on entity {}: component {} failed: {}", hook.label(), self.id, name, error);
        report.failures.push(ComponentFailure {
            component: name.to_string(),
            error,
        });
    }

    // ------------------------------------------------------------------------
    // Component management
    // ------------------------------------------------------------------------

    pub fn get_component(&self, type_name: &str) -> Option<ComponentCell> {
        self.components.get(type_name)
    }

    pub fn has_component(&self, type_name: &str) -> bool {
        self.components.contains(type_name)
    }

    /// Stage a component for attachment. It becomes live at the next sync and
    /// is started then if the entity is already initialized.
    pub fn add_component(&self, component: ComponentBox) {
        let name = component.type_name().to_string();
        if self.is_released() {
            warn!("Entity {} is released, dropping {}", self.id, name);
            return;
        }
        let notified = match component.kind() {
            ComponentKind::Script => self.bridge.script_attached(self.id, &name),
            _ => self.bridge.component_attached(self.id, &name),
        };
        log_bridge_failure(notified, "component_attached");
        debug!("Attaching {} to entity {}", name, self.id);
        self.components.stage_add(&name, component);
    }

    /// Attach `component`, replacing any live component of the same name.
    pub fn copy_component(&self, component: ComponentBox) {
        let name = component.type_name().to_string();
        if self.components.contains(&name) {
            self.components.stage_remove(&name, false);
        }
        self.add_component(component);
    }

    /// Stage the removal of a component; `notify` tells the native side once
    /// the removal is applied.
    pub fn remove_component(&self, type_name: &str, notify: bool) {
        self.components.stage_remove(type_name, notify);
    }

    /// Remove a component immediately and return it. Must not be called from
    /// inside a hook of this entity.
    pub fn take_component(&self, type_name: &str) -> KernelResult<Option<ComponentBox>> {
        let taken = self.components.take_now(type_name)?;
        if taken.is_some() {
            log_bridge_failure(
                self.bridge.component_detached(self.id, type_name),
                "component_detached",
            );
        }
        Ok(taken)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent())
            .field("components", &self.components.names())
            .field("initialized", &self.is_initialized())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Hook {
    fn label(&self) -> &'static str {
        match self {
            Hook::Start => "start",
            Hook::Update(_) => "update",
            Hook::Collision(_) => "on_collision",
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeResult;
    use crate::component::Component;
    use crate::error::ComponentError;
    use parking_lot::Mutex;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingBridge {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl NativeBridge for RecordingBridge {
        fn script_attached(&self, id: EntityId, type_name: &str) -> BridgeResult<()> {
            self.calls.lock().push(format!("script_attached {} {}", id, type_name));
            Ok(())
        }

        fn component_attached(&self, id: EntityId, type_name: &str) -> BridgeResult<()> {
            self.calls.lock().push(format!("component_attached {} {}", id, type_name));
            Ok(())
        }

        fn component_detached(&self, id: EntityId, type_name: &str) -> BridgeResult<()> {
            self.calls.lock().push(format!("component_detached {} {}", id, type_name));
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct Counts {
        starts: Arc<AtomicUsize>,
        updates: Arc<AtomicUsize>,
    }

    struct Counter(Counts);

    impl Component for Counter {
        fn start(&mut self, _ctx: &mut ComponentContext<'_>) -> ComponentResult<()> {
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn update(&mut self, _ctx: &mut ComponentContext<'_>, _dt: f32) -> ComponentResult<()> {
            self.0.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Records the live component count it observes and stages a new
    /// component on its first update.
    struct Spawner {
        observed: Arc<Mutex<Vec<usize>>>,
        spawned: bool,
    }

    impl Component for Spawner {
        fn update(&mut self, ctx: &mut ComponentContext<'_>, _dt: f32) -> ComponentResult<()> {
            self.observed.lock().push(ctx.entity().components().len());
            if !self.spawned {
                self.spawned = true;
                ctx.add_component(ComponentBox::plain("Child", Counter(Counts::default())));
                ctx.remove_component("Doomed");
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Faulty;

    impl Component for Faulty {
        fn update(&mut self, _ctx: &mut ComponentContext<'_>, _dt: f32) -> ComponentResult<()> {
            Err(ComponentError::failed("broken update"))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Panicky;

    impl Component for Panicky {
        fn update(&mut self, _ctx: &mut ComponentContext<'_>, _dt: f32) -> ComponentResult<()> {
            panic!("update exploded");
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn entity_with(bridge: Arc<dyn NativeBridge>) -> Entity {
        Entity::new(EntityId(7), "Probe", EntityFilter::default(), bridge)
    }

    fn entity() -> Entity {
        entity_with(Arc::new(crate::bridge::NullBridge))
    }

    #[test]
    fn test_start_initializes_and_starts_components() {
        let counts = Counts::default();
        let entity = entity();
        entity.add_component(ComponentBox::plain("Counter", Counter(counts.clone())));
        assert!(!entity.has_component("Counter"));

        let report = entity.start();
        assert!(report.is_ok());
        assert_eq!(report.invoked, 1);
        assert!(entity.is_initialized());
        assert!(entity.has_component("Counter"));
        assert_eq!(counts.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_sees_fixed_component_count() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let entity = entity();
        entity.add_component(ComponentBox::plain(
            "Spawner",
            Spawner {
                observed: observed.clone(),
                spawned: false,
            },
        ));
        entity.add_component(ComponentBox::plain("Doomed", Counter(Counts::default())));
        entity.add_component(ComponentBox::plain("Other", Counter(Counts::default())));
        entity.start();

        let report = entity.update(0.016);
        // Three updates, plus the start of the component added mid-pass.
        assert_eq!(report.invoked, 4);
        assert_eq!(*observed.lock(), vec![3]);

        let mut names = entity.components().names();
        names.sort();
        assert_eq!(names, vec!["Child", "Other", "Spawner"]);

        entity.update(0.016);
        assert_eq!(*observed.lock(), vec![3, 3]);
    }

    #[test]
    fn test_component_added_after_start_is_started_at_sync() {
        let counts = Counts::default();
        let entity = entity();
        entity.start();

        entity.add_component(ComponentBox::script("Late", Counter(counts.clone())));
        assert_eq!(counts.starts.load(Ordering::SeqCst), 0);

        entity.update(0.1);
        assert_eq!(counts.starts.load(Ordering::SeqCst), 1);
        // Added during this sync, so not yet updated.
        assert_eq!(counts.updates.load(Ordering::SeqCst), 0);

        entity.update(0.1);
        assert_eq!(counts.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_components_do_not_stop_others() {
        let counts = Counts::default();
        let entity = entity();
        entity.add_component(ComponentBox::plain("Faulty", Faulty));
        entity.add_component(ComponentBox::plain("Panicky", Panicky));
        entity.add_component(ComponentBox::plain("Counter", Counter(counts.clone())));
        entity.start();

        let report = entity.update(0.1);
        assert_eq!(report.invoked, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(counts.updates.load(Ordering::SeqCst), 1);

        let panicked = report
            .failures
            .iter()
            .find(|f| f.component == "Panicky")
            .unwrap();
        assert_eq!(
            panicked.error,
            ComponentError::Panicked("update exploded".to_string())
        );
    }

    #[test]
    fn test_inactive_entity_hides_active_values() {
        let entity = entity();
        entity.add_component(ComponentBox::plain("Counter", Counter(Counts::default())));
        entity.sync();
        assert_eq!(entity.components().active_values().len(), 1);

        entity.set_active(false);
        assert!(!entity.is_active());
        assert!(entity.components().active_values().is_empty());
    }

    #[test]
    fn test_bridge_notifications() {
        let bridge = Arc::new(RecordingBridge::default());
        let entity = entity_with(bridge.clone());

        entity.add_component(ComponentBox::script("Orbit", Counter(Counts::default())));
        entity.add_component(ComponentBox::plain("Mesh", Counter(Counts::default())));
        entity.sync();

        // Replacing via copy does not report a detach.
        entity.copy_component(ComponentBox::plain("Mesh", Counter(Counts::default())));
        entity.sync();

        entity.remove_component("Orbit", true);
        entity.sync();

        let taken = entity.take_component("Mesh").unwrap();
        assert!(taken.is_some());

        assert_eq!(
            bridge.calls(),
            vec![
                "script_attached #7 Orbit",
                "component_attached #7 Mesh",
                "component_attached #7 Mesh",
                "component_detached #7 Orbit",
                "component_detached #7 Mesh",
            ]
        );
        assert!(entity.components().is_empty());
    }

    #[test]
    fn test_children_are_unique() {
        let entity = entity();
        entity.add_child(EntityId(2));
        entity.add_child(EntityId(2));
        entity.add_child(EntityId(3));
        assert_eq!(entity.children(), vec![EntityId(2), EntityId(3)]);

        entity.remove_child(EntityId(2));
        assert_eq!(entity.children(), vec![EntityId(3)]);
    }
}
