//! Lifecycle state
//!
//! States of the module lifecycle manager and the events it broadcasts.

use std::path::PathBuf;
use std::time::Duration;

use kiln_kernel::{ComponentKind, EntityId};
use serde::{Deserialize, Serialize};

/// 模块生命周期状态
/// Module lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LifecycleState {
    /// No module loaded, nothing pending
    #[default]
    Idle,
    /// A generation is being loaded
    Loading,
    /// A module is loaded and ticking
    Active,
    /// Scripts are being detached from the world
    Migrating,
    /// The retired generation is being released
    Unloading,
    /// Waiting for the retired generation to become unreachable
    Verifying,
}

impl LifecycleState {
    /// A reload or unload window is open; ticks are held back.
    pub fn is_transitioning(&self) -> bool {
        !matches!(self, LifecycleState::Idle | LifecycleState::Active)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "Idle"),
            LifecycleState::Loading => write!(f, "Loading"),
            LifecycleState::Active => write!(f, "Active"),
            LifecycleState::Migrating => write!(f, "Migrating"),
            LifecycleState::Unloading => write!(f, "Unloading"),
            LifecycleState::Verifying => write!(f, "Verifying"),
        }
    }
}

/// 生命周期事件
/// Lifecycle event broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// 状态已变更
    /// State changed
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    /// 首次加载开始
    /// First load started
    LoadStarted { path: PathBuf, generation: u64 },
    /// 加载完成
    /// Load completed
    LoadCompleted {
        path: PathBuf,
        generation: u64,
        types: usize,
        duration: Duration,
    },
    /// 加载失败
    /// Load failed
    LoadFailed { path: PathBuf, error: String },
    /// 热重载开始
    /// Reload started
    ReloadStarted {
        path: PathBuf,
        from_generation: u64,
        generation: u64,
    },
    /// 热重载完成
    /// Reload completed
    ReloadCompleted {
        path: PathBuf,
        generation: u64,
        migrated: usize,
        failed: usize,
        duration: Duration,
    },
    /// 热重载失败，旧模块保持运行
    /// Reload failed, the previous module keeps running
    ReloadFailed {
        path: PathBuf,
        generation: u64,
        error: String,
    },
    /// 脚本已从实体分离
    /// Scripts detached from the world
    ScriptsDetached {
        generation: u64,
        scripts: usize,
        dropped: usize,
    },
    /// 旧代码已不可达
    /// Retired generation verified unreachable
    UnloadVerified { generation: u64, waited: Duration },
    /// 卸载等待超时
    /// Retired generation still reachable after the timeout
    UnloadTimedOut {
        generation: u64,
        outstanding: usize,
    },
    /// 单个实体迁移失败
    /// Re-attaching one script failed
    MigrationFailed {
        entity: EntityId,
        type_name: String,
        reason: String,
    },
    /// 发现脚本或系统类型
    /// Script or system type discovered
    TypeDiscovered {
        generation: u64,
        type_name: String,
        kind: ComponentKind,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_idle() {
        assert_eq!(LifecycleState::default(), LifecycleState::Idle);
    }

    #[test]
    fn test_transitioning_states() {
        assert!(!LifecycleState::Idle.is_transitioning());
        assert!(!LifecycleState::Active.is_transitioning());
        for state in [
            LifecycleState::Loading,
            LifecycleState::Migrating,
            LifecycleState::Unloading,
            LifecycleState::Verifying,
        ] {
            assert!(state.is_transitioning(), "{} should be transitioning", state);
        }
        assert!(LifecycleState::Active.is_active());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Verifying.to_string(), "Verifying");
        assert_eq!(LifecycleState::Idle.to_string(), "Idle");
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&LifecycleState::Migrating).unwrap();
        assert_eq!(json, "\"Migrating\"");
        let back: LifecycleState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LifecycleState::Migrating);
    }
}
