//! 脚本热重载模块
//!
//! Loads user-authored modules into isolated generations and replaces them at
//! runtime while the world keeps running:
//! - 模块加载与卸载验证 (module loading and unload verification)
//! - 脚本组件迁移 (script component migration)
//! - 产物监视 (artifact watching)

pub mod hot_reload;

pub use hot_reload::*;
pub use kiln_kernel;
