//! Module exports
//!
//! What a module hands to the host when it is declared: the constructible
//! types it defines and any static resources whose lifetime is tied to the
//! module generation.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use kiln_kernel::{Component, ComponentKind, System};

use super::source::ModuleLoadError;

/// Host/module ABI version. Bumped whenever [`ModuleExports`] changes shape.
pub const MODULE_API_VERSION: u32 = 1;

/// Exported symbol returning the module's [`MODULE_API_VERSION`].
pub const API_VERSION_SYMBOL: &[u8] = b"_kiln_module_api_version";

/// Exported symbol filling a [`ModuleExports`].
pub const DECLARE_SYMBOL: &[u8] = b"_kiln_module_declare";

/// Constructor for a component type.
pub type ComponentCtor = fn() -> Box<dyn Component>;

/// Constructor for a system type.
pub type SystemCtor = fn() -> Box<dyn System>;

/// Signature of a module's declare entry point.
pub type DeclareFn = fn(&mut ModuleExports);

/// One exported type.
///
/// Names are copied to the host heap at declaration, so they stay valid after
/// the module's code and data are unmapped.
#[derive(Clone)]
pub enum TypeExport {
    Component {
        name: Arc<str>,
        kind: ComponentKind,
        ctor: ComponentCtor,
    },
    System {
        name: Arc<str>,
        ctor: SystemCtor,
    },
}

impl TypeExport {
    pub fn name(&self) -> &str {
        match self {
            TypeExport::Component { name, .. } | TypeExport::System { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            TypeExport::Component { kind, .. } => *kind,
            TypeExport::System { .. } => ComponentKind::System,
        }
    }
}

impl fmt::Debug for TypeExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeExport")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Everything a module declares.
#[derive(Default)]
pub struct ModuleExports {
    types: Vec<TypeExport>,
    resources: Vec<Box<dyn Any + Send + Sync>>,
}

impl ModuleExports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a plain behavior component.
    pub fn component<C: Component + Default>(&mut self, name: &str) -> &mut Self {
        self.component_with(name, || -> Box<dyn Component> { Box::new(C::default()) })
    }

    pub fn component_with(&mut self, name: &str, ctor: ComponentCtor) -> &mut Self {
        self.types.push(TypeExport::Component {
            name: Arc::from(name),
            kind: ComponentKind::Plain,
            ctor,
        });
        self
    }

    /// Export a script component, recreated by name across reloads.
    pub fn script<C: Component + Default>(&mut self, name: &str) -> &mut Self {
        self.script_with(name, || -> Box<dyn Component> { Box::new(C::default()) })
    }

    pub fn script_with(&mut self, name: &str, ctor: ComponentCtor) -> &mut Self {
        self.types.push(TypeExport::Component {
            name: Arc::from(name),
            kind: ComponentKind::Script,
            ctor,
        });
        self
    }

    /// Export a system, registered with the scheduler on load.
    pub fn system<S: System + Default>(&mut self, name: &str) -> &mut Self {
        self.system_with(name, || -> Box<dyn System> { Box::new(S::default()) })
    }

    pub fn system_with(&mut self, name: &str, ctor: SystemCtor) -> &mut Self {
        self.types.push(TypeExport::System {
            name: Arc::from(name),
            ctor,
        });
        self
    }

    /// Hand a static resource to the host. It is dropped with the generation,
    /// before the module code is released.
    pub fn resource<T: Any + Send + Sync>(&mut self, value: T) -> &mut Self {
        self.resources.push(Box::new(value));
        self
    }

    pub fn types(&self) -> &[TypeExport] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Reject modules that export nothing or export a name twice.
    pub fn validate(&self) -> Result<(), ModuleLoadError> {
        if self.types.is_empty() {
            return Err(ModuleLoadError::EmptyModule);
        }
        let mut seen = HashSet::new();
        for export in &self.types {
            if !seen.insert(export.name()) {
                return Err(ModuleLoadError::DuplicateExport(export.name().to_string()));
            }
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Vec<TypeExport>, Vec<Box<dyn Any + Send + Sync>>) {
        (self.types, self.resources)
    }
}

impl fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleExports")
            .field("types", &self.types)
            .field("resources", &self.resources.len())
            .finish()
    }
}

/// Emit the entry points of a module built as a `cdylib`.
///
/// ```rust,ignore
/// kiln_scripting::declare_module!(|exports| {
///     exports.script::<Orbit>("Orbit").system::<Gravity>("Gravity");
/// });
/// ```
#[macro_export]
macro_rules! declare_module {
    ($declare:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _kiln_module_api_version() -> u32 {
            $crate::hot_reload::MODULE_API_VERSION
        }

        #[unsafe(no_mangle)]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn _kiln_module_declare(exports: &mut $crate::hot_reload::ModuleExports) {
            let declare: $crate::hot_reload::DeclareFn = $declare;
            declare(exports);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_kernel::World;
    use kiln_kernel::error::ComponentResult;

    #[derive(Default)]
    struct Orbit;

    impl Component for Orbit {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Gravity;

    impl System for Gravity {
        fn update(&mut self, _world: &World, _dt: f32) -> ComponentResult<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_exports_classification() {
        let mut exports = ModuleExports::new();
        exports
            .component::<Orbit>("Mesh")
            .script::<Orbit>("Orbit")
            .system::<Gravity>("Gravity")
            .resource(42u32);

        let kinds: Vec<_> = exports.types().iter().map(|t| (t.name(), t.kind())).collect();
        assert_eq!(
            kinds,
            vec![
                ("Mesh", ComponentKind::Plain),
                ("Orbit", ComponentKind::Script),
                ("Gravity", ComponentKind::System),
            ]
        );
        assert_eq!(exports.resource_count(), 1);
        assert!(exports.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        assert!(matches!(
            ModuleExports::new().validate(),
            Err(ModuleLoadError::EmptyModule)
        ));

        let mut exports = ModuleExports::new();
        exports.script::<Orbit>("Orbit").component::<Orbit>("Orbit");
        assert!(matches!(
            exports.validate(),
            Err(ModuleLoadError::DuplicateExport(name)) if name == "Orbit"
        ));
    }

    #[test]
    fn test_export_names_are_owned_by_the_host() {
        let declared = String::from("Orbit");
        let mut exports = ModuleExports::new();
        exports.script::<Orbit>(&declared);
        drop(declared);

        let copy = exports.types()[0].clone();
        drop(exports);
        assert_eq!(copy.name(), "Orbit");
        assert_eq!(copy.kind(), ComponentKind::Script);
    }

    mod declared {
        use super::*;

        crate::declare_module!(|exports| {
            exports.script::<Orbit>("Orbit");
        });

        #[test]
        fn test_declare_module_entry_points() {
            assert_eq!(_kiln_module_api_version(), MODULE_API_VERSION);
            let mut exports = ModuleExports::new();
            _kiln_module_declare(&mut exports);
            assert_eq!(exports.len(), 1);
            assert_eq!(exports.types()[0].name(), "Orbit");
        }
    }
}
