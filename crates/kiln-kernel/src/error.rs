//! Typed errors for the kernel.

use thiserror::Error;

use crate::entity::EntityId;

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Result alias for component and system hooks.
pub type ComponentResult<T> = Result<T, ComponentError>;

/// Errors raised by a component or system hook.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ComponentError {
    /// The hook reported a failure of its own.
    #[error("{0}")]
    Failed(String),

    /// The hook panicked; the payload message is kept when it is a string.
    #[error("hook panicked: {0}")]
    Panicked(String),
}

impl ComponentError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Errors returned by the native bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BridgeError {
    /// The native side rejected the call.
    #[error("native call `{call}` failed: {reason}")]
    CallFailed { call: &'static str, reason: String },

    /// The native side is not available.
    #[error("native bridge unavailable")]
    Unavailable,
}

/// Errors that can occur in entity, container and world operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Entity already registered: {0}")]
    DuplicateEntity(EntityId),

    #[error("Component `{component}` not found on entity {entity}")]
    ComponentNotFound { entity: EntityId, component: String },

    /// The component is borrowed by an in-flight dispatch snapshot.
    #[error("Component `{0}` is in use and cannot be moved")]
    ComponentBusy(String),

    #[error("Component factory error: {0}")]
    Factory(String),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
