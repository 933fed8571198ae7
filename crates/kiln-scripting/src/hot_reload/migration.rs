//! Script migration
//!
//! Before a generation is released, every component it defines is detached
//! from the world. Script names are kept in each entity's migration list and
//! re-instantiated from the next registry once unload has been verified.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_kernel::{ComponentKind, Entity, EntityId, World, notify_bridge};
use rayon::prelude::*;
use tracing::{debug, warn};

use super::registry::{RegistryError, TypeRegistry};

/// A non-script component dropped with its generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedComponent {
    pub entity: EntityId,
    pub type_name: String,
    pub kind: ComponentKind,
}

/// Outcome of detaching one generation from the world.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetachSummary {
    pub generation: u64,
    /// Entities that lost at least one component.
    pub entities: usize,
    /// Script components detached and recorded for migration.
    pub scripts: usize,
    pub dropped: Vec<DroppedComponent>,
}

/// Re-attaching one recorded script failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFailure {
    pub entity: EntityId,
    pub type_name: String,
    pub error: RegistryError,
}

/// Outcome of re-attaching recorded scripts from a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Generation the scripts were re-instantiated from.
    pub generation: u64,
    /// Entities that had a non-empty migration list.
    pub entities: usize,
    pub migrated: usize,
    pub failures: Vec<MigrationFailure>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Fold another pass over the same generation into this report.
    pub fn absorb(&mut self, other: MigrationReport) {
        self.entities += other.entities;
        self.migrated += other.migrated;
        self.failures.extend(other.failures);
        self.failures
            .sort_by(|a, b| (a.entity, &a.type_name).cmp(&(b.entity, &b.type_name)));
    }
}

/// Detach every component of `generation` from every entity.
pub fn detach_generation(world: &World, generation: u64) -> DetachSummary {
    let entities = world.entities();
    let per_entity: Vec<(EntityId, Vec<(String, ComponentKind)>)> = entities
        .par_iter()
        .map(|entity| (entity.id(), detach_entity(entity, generation)))
        .filter(|(_, detached)| !detached.is_empty())
        .collect();

    let mut summary = DetachSummary {
        generation,
        entities: per_entity.len(),
        ..Default::default()
    };
    for (entity, detached) in per_entity {
        for (type_name, kind) in detached {
            if kind == ComponentKind::Script {
                summary.scripts += 1;
            } else {
                warn!(
                    "Dropping {} component {} of entity {} with generation {}",
                    kind, type_name, entity, generation
                );
                summary.dropped.push(DroppedComponent {
                    entity,
                    type_name,
                    kind,
                });
            }
        }
    }
    debug!(
        "Detached generation {}: {} scripts, {} dropped, {} entities",
        generation,
        summary.scripts,
        summary.dropped.len(),
        summary.entities
    );
    summary
}

fn detach_entity(entity: &Entity, generation: u64) -> Vec<(String, ComponentKind)> {
    let detached = entity.components().detach_generation(generation);
    for (type_name, _) in &detached {
        notify_bridge(
            entity.bridge().component_detached(entity.id(), type_name),
            "component_detached",
        );
    }
    detached
}

/// Re-instantiate each entity's recorded scripts from `registry`.
///
/// Resolved names leave the migration list. Unresolved names stay when
/// `retain_unresolved` is set, so a later generation can pick them up.
pub fn reattach_all(
    world: &World,
    registry: &Arc<TypeRegistry>,
    retain_unresolved: bool,
) -> MigrationReport {
    let entities = world.entities();
    let outcomes: Vec<(usize, Vec<MigrationFailure>)> = entities
        .par_iter()
        .filter(|entity| !entity.components().migration_list().is_empty())
        .map(|entity| reattach_entity(entity, registry, retain_unresolved))
        .collect();

    let mut report = MigrationReport {
        generation: registry.generation(),
        entities: outcomes.len(),
        ..Default::default()
    };
    for (migrated, failures) in outcomes {
        report.migrated += migrated;
        report.failures.extend(failures);
    }
    report
        .failures
        .sort_by(|a, b| (a.entity, &a.type_name).cmp(&(b.entity, &b.type_name)));
    report
}

fn reattach_entity(
    entity: &Entity,
    registry: &TypeRegistry,
    retain_unresolved: bool,
) -> (usize, Vec<MigrationFailure>) {
    let mut resolved = Vec::new();
    let mut failures = Vec::new();

    for type_name in entity.components().migration_list() {
        // Attached again by hand while the reload window was open.
        if entity.has_component(&type_name) {
            resolved.push(type_name);
            continue;
        }
        match registry.instantiate(&type_name) {
            Ok(component) => {
                entity.add_component(component);
                resolved.push(type_name);
            }
            Err(error) => {
                warn!(
                    "Entity {}: cannot migrate {}: {}",
                    entity.id(),
                    type_name,
                    error
                );
                failures.push(MigrationFailure {
                    entity: entity.id(),
                    type_name,
                    error,
                });
            }
        }
    }

    let components = entity.components();
    if retain_unresolved {
        components.retain_migration(|name| !resolved.iter().any(|r| r == name));
    } else {
        components.clear_migration();
    }

    let started = entity.sync();
    for failure in &started.failures {
        warn!(
            "Entity {}: migrated {} failed to start: {}",
            entity.id(),
            failure.component,
            failure.error
        );
    }
    (resolved.len(), failures)
}

/// Rebuild non-script components dropped by [`detach_generation`] from the
/// registry of the same generation, for a reload that is being rolled back.
///
/// Entities released in the meantime are skipped, as are names attached again
/// by hand.
pub fn restore_dropped(
    world: &World,
    registry: &TypeRegistry,
    dropped: &[DroppedComponent],
) -> MigrationReport {
    let mut by_entity: BTreeMap<EntityId, Vec<&str>> = BTreeMap::new();
    for component in dropped {
        by_entity
            .entry(component.entity)
            .or_default()
            .push(&component.type_name);
    }

    let mut report = MigrationReport {
        generation: registry.generation(),
        ..Default::default()
    };
    for (id, names) in by_entity {
        let Some(entity) = world.get(id) else {
            debug!("Entity {} released before {} components could be restored", id, names.len());
            continue;
        };
        report.entities += 1;
        for type_name in names {
            if entity.has_component(type_name) {
                report.migrated += 1;
                continue;
            }
            match registry.instantiate(type_name) {
                Ok(component) => {
                    entity.add_component(component);
                    report.migrated += 1;
                }
                Err(error) => {
                    warn!("Entity {}: cannot restore {}: {}", id, type_name, error);
                    report.failures.push(MigrationFailure {
                        entity: id,
                        type_name: type_name.to_string(),
                        error,
                    });
                }
            }
        }
        let started = entity.sync();
        for failure in &started.failures {
            warn!(
                "Entity {}: restored {} failed to start: {}",
                id, failure.component, failure.error
            );
        }
    }
    report
}

/// Entities with recorded script names awaiting a generation that defines them.
pub fn pending_migrations(world: &World) -> Vec<(EntityId, Vec<String>)> {
    world
        .entities()
        .iter()
        .filter_map(|entity| {
            let names = entity.components().migration_list();
            (!names.is_empty()).then(|| (entity.id(), names))
        })
        .collect()
}
