//! Type registry
//!
//! Name and key lookup of the constructible types of exactly one generation.
//! A registry is built whole from a load context and never merged with
//! another one.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_kernel::error::{KernelError, KernelResult};
use kiln_kernel::{
    ComponentBox, ComponentFactory, ComponentInfo, ComponentKind, Lease, SystemBox, TypeKey,
};
use tracing::debug;

use super::context::{ContextShared, LoadContext};
use super::exports::TypeExport;

/// Registry error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Type `{name}` not found in generation {generation}")]
    TypeNotFound { name: String, generation: u64 },

    #[error("Generation {0} is unloading; no new instances")]
    ContextRevoked(u64),

    #[error("Type `{name}` is a {actual}, not a {expected}")]
    WrongKind {
        name: String,
        expected: &'static str,
        actual: ComponentKind,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A constructible type discovered in a module.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    info: ComponentInfo,
    export: TypeExport,
}

impl TypeDescriptor {
    pub fn name(&self) -> &str {
        &self.info.type_name
    }

    pub fn kind(&self) -> ComponentKind {
        self.info.kind
    }

    pub fn key(&self) -> TypeKey {
        self.info.key
    }

    pub fn info(&self) -> &ComponentInfo {
        &self.info
    }
}

/// Registry of one generation's types.
pub struct TypeRegistry {
    generation: u64,
    descriptors: Vec<TypeDescriptor>,
    by_name: HashMap<Arc<str>, usize>,
    by_key: HashMap<TypeKey, usize>,
    // Keeps the generation alive while the registry can still construct.
    context: Arc<ContextShared>,
}

impl TypeRegistry {
    /// Enumerate and classify every export of `context`.
    pub fn build(context: &LoadContext) -> Self {
        Self::from_shared(context.shared().clone())
    }

    pub(crate) fn from_shared(context: Arc<ContextShared>) -> Self {
        let generation = kiln_kernel::CodeOwner::generation(context.as_ref());
        let descriptors: Vec<TypeDescriptor> = context
            .types()
            .iter()
            .map(|export| TypeDescriptor {
                info: ComponentInfo::new(export.name(), export.kind(), generation),
                export: export.clone(),
            })
            .collect();

        let mut by_name = HashMap::with_capacity(descriptors.len());
        let mut by_key = HashMap::with_capacity(descriptors.len());
        for (i, desc) in descriptors.iter().enumerate() {
            by_name.insert(desc.info.type_name.clone(), i);
            by_key.insert(desc.info.key, i);
        }
        debug!(
            "Built type registry for generation {} ({} types)",
            generation,
            descriptors.len()
        );

        Self {
            generation,
            descriptors,
            by_name,
            by_key,
            context,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.by_name.get(name).map(|&i| &self.descriptors[i])
    }

    pub fn get_by_key(&self, key: TypeKey) -> Option<&TypeDescriptor> {
        self.by_key.get(&key).map(|&i| &self.descriptors[i])
    }

    pub fn descriptors(&self) -> &[TypeDescriptor] {
        &self.descriptors
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(TypeDescriptor::name).collect()
    }

    pub fn of_kind(&self, kind: ComponentKind) -> impl Iterator<Item = &TypeDescriptor> {
        self.descriptors.iter().filter(move |d| d.kind() == kind)
    }

    fn lease(&self) -> RegistryResult<Lease> {
        if self.context.is_revoked() {
            return Err(RegistryError::ContextRevoked(self.generation));
        }
        Ok(Lease::new(self.context.clone()))
    }

    fn lookup(&self, name: &str) -> RegistryResult<&TypeDescriptor> {
        self.get(name).ok_or_else(|| RegistryError::TypeNotFound {
            name: name.to_string(),
            generation: self.generation,
        })
    }

    /// Construct a fresh component of type `name`.
    pub fn instantiate(&self, name: &str) -> RegistryResult<ComponentBox> {
        let desc = self.lookup(name)?;
        self.construct_component(desc)
    }

    pub fn instantiate_by_key(&self, key: TypeKey) -> RegistryResult<ComponentBox> {
        let desc = self
            .get_by_key(key)
            .ok_or_else(|| RegistryError::TypeNotFound {
                name: format!("{:?}", key),
                generation: self.generation,
            })?;
        self.construct_component(desc)
    }

    fn construct_component(&self, desc: &TypeDescriptor) -> RegistryResult<ComponentBox> {
        match &desc.export {
            TypeExport::Component { ctor, .. } => {
                let lease = self.lease()?;
                Ok(ComponentBox::new(desc.info.clone(), ctor()).with_lease(lease))
            }
            TypeExport::System { .. } => Err(RegistryError::WrongKind {
                name: desc.name().to_string(),
                expected: "component",
                actual: ComponentKind::System,
            }),
        }
    }

    /// Construct a fresh system of type `name`.
    pub fn instantiate_system(&self, name: &str) -> RegistryResult<SystemBox> {
        let desc = self.lookup(name)?;
        match &desc.export {
            TypeExport::System { ctor, .. } => {
                let lease = self.lease()?;
                Ok(SystemBox::new(desc.name(), ctor()).with_lease(lease))
            }
            TypeExport::Component { kind, .. } => Err(RegistryError::WrongKind {
                name: desc.name().to_string(),
                expected: "system",
                actual: *kind,
            }),
        }
    }

    /// One fresh instance of every exported system.
    pub fn instantiate_systems(&self) -> RegistryResult<Vec<SystemBox>> {
        self.of_kind(ComponentKind::System)
            .map(|d| self.instantiate_system(d.name()))
            .collect()
    }
}

impl ComponentFactory for TypeRegistry {
    fn create(&self, type_name: &str) -> KernelResult<ComponentBox> {
        self.instantiate(type_name)
            .map_err(|e| KernelError::Factory(e.to_string()))
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("generation", &self.generation)
            .field("types", &self.names())
            .finish()
    }
}
