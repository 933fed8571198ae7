//! Kiln 内核：实体、组件容器、世界注册表与逐帧分发
//! Kiln kernel: entities, component containers, the world registry and
//! per-tick dispatch that hot-reloadable modules plug into.
//!
//! 热重载模块在此之上构建（见 `kiln-scripting`）。
//! Hot-reloadable modules build on top of this crate (see `kiln-scripting`).

// ============================================================================
// Core types
// ============================================================================

// error module
pub mod error;
pub use error::*;

// lease module
pub mod lease;
pub use lease::{CodeOwner, Lease};

// component module
pub mod component;
pub use component::{
    Component, ComponentBox, ComponentCell, ComponentContext, ComponentFactory, ComponentInfo,
    ComponentKind, ComponentsContainer, TypeKey,
};

// entity module
pub mod entity;
pub use entity::{ComponentFailure, Entity, EntityFilter, EntityId, EntityReport};

// ============================================================================
// World and dispatch
// ============================================================================

// native bridge
pub mod bridge;
pub use bridge::{ForceMode, NativeBridge, NullBridge, notify_bridge};

// world registry
pub mod world;
pub use world::World;

// parallel dispatch
pub mod dispatch;
pub use dispatch::{CollisionOutcome, DispatchReport};

// system scheduling
pub mod system;
pub use system::{System, SystemBox, SystemFailure, SystemManager, SystemPriority, SystemScheduler};

// ============================================================================
// Ambient
// ============================================================================

// configuration
pub mod config;
pub use crate::config::HotReloadConfig;

// logging module
pub mod logging;
