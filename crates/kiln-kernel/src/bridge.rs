//! Native bridge
//!
//! The boundary the kernel calls into for the native physics/rendering side.
//! Every call is a fire-and-forget notification: only success or failure of the
//! call itself is consulted, and failures are logged rather than propagated.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::component::ComponentKind;
use crate::entity::EntityId;
use crate::error::BridgeError;

/// Result type for native bridge calls.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// How a force is applied to a rigid body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum ForceMode {
    #[default]
    None = 0,
    Force = 1,
    Impulse = 2,
}

/// Native side of the engine. All methods default to a no-op success.
pub trait NativeBridge: Send + Sync {
    fn create_entity(&self, id: EntityId, name: &str) -> BridgeResult<()> {
        let _ = (id, name);
        Ok(())
    }

    fn release_entity(&self, id: EntityId) -> BridgeResult<()> {
        let _ = id;
        Ok(())
    }

    /// Clone the native state of `original` into `new_id`.
    fn instantiate(
        &self,
        original: EntityId,
        new_id: EntityId,
        parent: Option<EntityId>,
    ) -> BridgeResult<()> {
        let _ = (original, new_id, parent);
        Ok(())
    }

    fn set_active(&self, id: EntityId, active: bool) -> BridgeResult<()> {
        let _ = (id, active);
        Ok(())
    }

    fn component_attached(&self, id: EntityId, type_name: &str) -> BridgeResult<()> {
        let _ = (id, type_name);
        Ok(())
    }

    fn script_attached(&self, id: EntityId, type_name: &str) -> BridgeResult<()> {
        let _ = (id, type_name);
        Ok(())
    }

    fn component_detached(&self, id: EntityId, type_name: &str) -> BridgeResult<()> {
        let _ = (id, type_name);
        Ok(())
    }

    fn apply_force(&self, id: EntityId, mode: ForceMode, force: [f32; 3]) -> BridgeResult<()> {
        let _ = (id, mode, force);
        Ok(())
    }

    /// A script or system type became available in a freshly loaded module.
    fn type_discovered(&self, type_name: &str, kind: ComponentKind) -> BridgeResult<()> {
        let _ = (type_name, kind);
        Ok(())
    }

    fn refresh_scene(&self) -> BridgeResult<()> {
        Ok(())
    }
}

/// Bridge that accepts every call and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBridge;

impl NativeBridge for NullBridge {}

pub(crate) fn log_bridge_failure(result: BridgeResult<()>, call: &str) {
    if let Err(e) = result {
        warn!("Native bridge call {} failed: {}", call, e);
    }
}

/// Log-and-continue wrapper for callers outside the kernel.
pub fn notify_bridge(result: BridgeResult<()>, call: &str) -> bool {
    let ok = result.is_ok();
    log_bridge_failure(result, call);
    ok
}
