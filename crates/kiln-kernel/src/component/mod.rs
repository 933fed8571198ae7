use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId};
use crate::error::{ComponentResult, KernelResult};
use crate::lease::Lease;

pub mod container;
pub use container::{ComponentCell, ComponentsContainer, ContainerSnapshot, SyncOutcome};

// ============================================================================
// 组件分类 (Component classification)
// ============================================================================

/// 组件类型
/// Component classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentKind {
    /// 普通组件
    /// Plain behavior component
    Plain,
    /// 用户脚本，热加载后按名称重建
    /// User-authored script, recreated by name after a reload
    Script,
    /// 调度系统
    /// Scheduled system
    System,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Plain => write!(f, "Plain"),
            ComponentKind::Script => write!(f, "Script"),
            ComponentKind::System => write!(f, "System"),
        }
    }
}

/// Stable per-generation type identifier.
///
/// Computed once when a registry is built (FNV-1a over the generation and the
/// type name) so hot paths compare integers instead of hashing names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey(pub u64);

impl TypeKey {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    pub fn new(generation: u64, name: &str) -> Self {
        let mut hash = Self::OFFSET;
        for byte in generation.to_le_bytes().iter().chain(name.as_bytes()) {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(Self::PRIME);
        }
        Self(hash)
    }
}

/// 组件元数据
/// Component metadata shared by every instance of a type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    /// 类型名称（迁移键）
    /// Type name (the migration key)
    pub type_name: Arc<str>,
    pub kind: ComponentKind,
    pub key: TypeKey,
}

impl ComponentInfo {
    pub fn new(type_name: &str, kind: ComponentKind, generation: u64) -> Self {
        Self {
            type_name: Arc::from(type_name),
            kind,
            key: TypeKey::new(generation, type_name),
        }
    }
}

// ============================================================================
// 组件 trait (Component trait)
// ============================================================================

/// 核心组件 trait
/// Core component trait
///
/// Every hook defaults to a no-op. Hooks run with the component's cell locked,
/// so mutations of the owning entity go through the staging methods of
/// [`ComponentContext`].
pub trait Component: Any + Send {
    /// 启动
    /// Called once when the entity starts, or right after attachment to an
    /// already started entity
    fn start(&mut self, ctx: &mut ComponentContext<'_>) -> ComponentResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// 每帧更新
    /// Per-tick update
    fn update(&mut self, ctx: &mut ComponentContext<'_>, dt: f32) -> ComponentResult<()> {
        let _ = (ctx, dt);
        Ok(())
    }

    /// 碰撞回调
    /// Collision notification against `other`
    fn on_collision(
        &mut self,
        ctx: &mut ComponentContext<'_>,
        other: EntityId,
    ) -> ComponentResult<()> {
        let _ = (ctx, other);
        Ok(())
    }

    /// Clone this instance for template instantiation. `None` means the
    /// instance is rebuilt through a [`ComponentFactory`] instead.
    fn duplicate(&self) -> Option<Box<dyn Component>> {
        None
    }

    /// 转换为 Any（用于向下转型）
    /// Convert to Any (for downcasting)
    fn as_any(&self) -> &dyn Any;

    /// 转换为可变 Any
    /// Convert to mutable Any
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Builds fresh component instances by type name.
pub trait ComponentFactory: Send + Sync {
    fn create(&self, type_name: &str) -> KernelResult<ComponentBox>;
}

// ============================================================================
// 组件实例 (Component instance)
// ============================================================================

/// An owned component instance together with its metadata and code lease.
pub struct ComponentBox {
    // Field order matters: the instance is dropped before the lease on the
    // code that defines it.
    instance: Box<dyn Component>,
    info: ComponentInfo,
    lease: Option<Lease>,
}

impl ComponentBox {
    pub fn new(info: ComponentInfo, instance: Box<dyn Component>) -> Self {
        Self {
            instance,
            info,
            lease: None,
        }
    }

    /// Host-defined plain component (generation 0, no lease).
    pub fn plain<C: Component>(type_name: &str, component: C) -> Self {
        Self::new(
            ComponentInfo::new(type_name, ComponentKind::Plain, 0),
            Box::new(component),
        )
    }

    /// Host-defined script component (generation 0, no lease).
    pub fn script<C: Component>(type_name: &str, component: C) -> Self {
        Self::new(
            ComponentInfo::new(type_name, ComponentKind::Script, 0),
            Box::new(component),
        )
    }

    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn info(&self) -> &ComponentInfo {
        &self.info
    }

    pub fn type_name(&self) -> &str {
        &self.info.type_name
    }

    pub fn kind(&self) -> ComponentKind {
        self.info.kind
    }

    pub fn is_script(&self) -> bool {
        self.info.kind == ComponentKind::Script
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Generation of the module that owns this instance's code, if any.
    pub fn generation(&self) -> Option<u64> {
        self.lease.as_ref().map(Lease::generation)
    }

    pub fn instance(&self) -> &dyn Component {
        self.instance.as_ref()
    }

    pub fn instance_mut(&mut self) -> &mut dyn Component {
        self.instance.as_mut()
    }

    pub fn downcast_ref<T: Component>(&self) -> Option<&T> {
        self.instance.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.instance.as_any_mut().downcast_mut::<T>()
    }

    /// Duplicate through [`Component::duplicate`], keeping metadata and lease.
    pub fn try_duplicate(&self) -> Option<ComponentBox> {
        self.instance.duplicate().map(|instance| ComponentBox {
            instance,
            info: self.info.clone(),
            lease: self.lease.clone(),
        })
    }
}

impl fmt::Debug for ComponentBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentBox")
            .field("type_name", &self.info.type_name)
            .field("kind", &self.info.kind)
            .field("generation", &self.generation())
            .finish()
    }
}

// ============================================================================
// 组件上下文 (Hook context)
// ============================================================================

/// Context handed to every component hook.
pub struct ComponentContext<'a> {
    entity: &'a Entity,
}

impl<'a> ComponentContext<'a> {
    pub(crate) fn new(entity: &'a Entity) -> Self {
        Self { entity }
    }

    pub fn entity(&self) -> &'a Entity {
        self.entity
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity.id()
    }

    /// Stage a component addition on the owning entity; applied at the next
    /// sync point.
    pub fn add_component(&mut self, component: ComponentBox) {
        self.entity.add_component(component);
    }

    /// Stage a removal on the owning entity; applied at the next sync point.
    pub fn remove_component(&mut self, type_name: &str) {
        self.entity.remove_component(type_name, true);
    }
}

#[cfg(test)]
mod tests;
