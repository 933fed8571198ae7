//! World registry
//!
//! The set of live entities keyed by id. The table is replaced whole on every
//! structural change so readers holding a snapshot never see a half-applied
//! insert or removal.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::bridge::{NativeBridge, NullBridge, log_bridge_failure};
use crate::component::ComponentFactory;
use crate::entity::{Entity, EntityFilter, EntityId};
use crate::error::{KernelError, KernelResult};

pub type EntityTable = HashMap<EntityId, Arc<Entity>>;

pub struct World {
    entities: RwLock<Arc<EntityTable>>,
    next_id: AtomicI32,
    bridge: Arc<dyn NativeBridge>,
}

impl World {
    pub fn new(bridge: Arc<dyn NativeBridge>) -> Self {
        Self {
            entities: RwLock::new(Arc::new(HashMap::new())),
            next_id: AtomicI32::new(1),
            bridge,
        }
    }

    pub fn bridge(&self) -> &Arc<dyn NativeBridge> {
        &self.bridge
    }

    /// Current entity table. Cheap to clone, never changes after return.
    pub fn snapshot(&self) -> Arc<EntityTable> {
        self.entities.read().clone()
    }

    pub fn entities(&self) -> Vec<Arc<Entity>> {
        let mut entities: Vec<_> = self.snapshot().values().cloned().collect();
        entities.sort_by_key(|e| e.id());
        entities
    }

    pub fn get(&self, id: EntityId) -> Option<Arc<Entity>> {
        self.entities.read().get(&id).cloned()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    fn swap<R>(&self, f: impl FnOnce(&mut EntityTable) -> R) -> R {
        let mut guard = self.entities.write();
        let mut table = EntityTable::clone(&guard);
        let result = f(&mut table);
        *guard = Arc::new(table);
        result
    }

    fn allocate_id(&self) -> EntityId {
        EntityId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an entity with a world-allocated id and announce it natively.
    pub fn spawn(&self, name: &str) -> KernelResult<Arc<Entity>> {
        self.spawn_with(name, EntityFilter::default())
    }

    pub fn spawn_with(&self, name: &str, filter: EntityFilter) -> KernelResult<Arc<Entity>> {
        let id = self.allocate_id();
        self.bridge.create_entity(id, name)?;
        self.insert(Entity::new(id, name, filter, self.bridge.clone()))
    }

    /// Register an entity whose id was assigned by the native side.
    pub fn adopt(&self, id: EntityId, name: &str, filter: EntityFilter) -> KernelResult<Arc<Entity>> {
        // Keep world-allocated ids clear of native ones.
        self.next_id.fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
        self.insert(Entity::new(id, name, filter, self.bridge.clone()))
    }

    fn insert(&self, entity: Entity) -> KernelResult<Arc<Entity>> {
        let entity = Arc::new(entity);
        let id = entity.id();
        self.swap(|table| {
            if table.contains_key(&id) {
                return Err(KernelError::DuplicateEntity(id));
            }
            table.insert(id, entity.clone());
            Ok(())
        })?;
        debug!("Entity {} ({}) added to world", id, entity.name());
        Ok(entity)
    }

    /// Release an entity: drop it from the table, detach it from its parent
    /// and children, drop its components and tell the native side.
    pub fn release(&self, id: EntityId) -> KernelResult<()> {
        let entity = self
            .swap(|table| table.remove(&id))
            .ok_or(KernelError::EntityNotFound(id))?;

        if let Some(parent) = entity.parent().and_then(|p| self.get(p)) {
            parent.remove_child(id);
        }
        for child in entity.children() {
            if let Some(child) = self.get(child) {
                child.set_parent(None);
            }
        }
        let dropped = entity.release_components();
        log_bridge_failure(self.bridge.release_entity(id), "release_entity");
        info!("Released entity {} ({} components dropped)", id, dropped);
        Ok(())
    }

    pub fn set_parent(&self, child: EntityId, parent: Option<EntityId>) -> KernelResult<()> {
        let entity = self.get(child).ok_or(KernelError::EntityNotFound(child))?;
        let new_parent = match parent {
            Some(p) => Some(self.get(p).ok_or(KernelError::EntityNotFound(p))?),
            None => None,
        };
        if let Some(old) = entity.parent().and_then(|p| self.get(p)) {
            old.remove_child(child);
        }
        if let Some(p) = &new_parent {
            p.add_child(child);
        }
        entity.set_parent(parent);
        Ok(())
    }

    /// Create a copy of `template`: natively cloned state plus a fresh
    /// instance of every active component. Components that cannot be
    /// duplicated are rebuilt through `factory`; failures are logged and
    /// skipped.
    pub fn instantiate(
        &self,
        template: EntityId,
        parent: Option<EntityId>,
        factory: &dyn ComponentFactory,
    ) -> KernelResult<Arc<Entity>> {
        let original = self.get(template).ok_or(KernelError::EntityNotFound(template))?;
        let id = self.allocate_id();
        self.bridge.instantiate(template, id, parent)?;

        let name = format!("{}{}", original.name(), id.0);
        let instance = self.insert(Entity::new(id, &name, original.filter(), self.bridge.clone()))?;
        if parent.is_some() {
            if let Err(e) = self.set_parent(id, parent) {
                if let Err(release) = self.release(id) {
                    warn!("Instantiate {} -> {}: cleanup failed: {}", template, id, release);
                }
                return Err(e);
            }
        }

        for cell in original.components().active_values() {
            let copy = {
                let source = cell.lock();
                match source.try_duplicate() {
                    Some(copy) => Ok(copy),
                    None => factory.create(source.type_name()),
                }
            };
            match copy {
                Ok(component) => instance.copy_component(component),
                Err(e) => warn!("Instantiate {} -> {}: skipped component: {}", template, id, e),
            }
        }
        instance.sync();
        Ok(instance)
    }

    /// Move a component between entities, detaching it from the source first.
    pub fn move_component(&self, from: EntityId, to: EntityId, type_name: &str) -> KernelResult<()> {
        let source = self.get(from).ok_or(KernelError::EntityNotFound(from))?;
        let target = self.get(to).ok_or(KernelError::EntityNotFound(to))?;
        let component = source
            .take_component(type_name)?
            .ok_or_else(|| KernelError::ComponentNotFound {
                entity: from,
                component: type_name.to_string(),
            })?;
        target.copy_component(component);
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new(Arc::new(NullBridge))
    }
}
