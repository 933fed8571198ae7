use super::*;
use crate::error::KernelError;
use crate::lease::{CodeOwner, Lease};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

struct Marker(u32);

impl Component for Marker {
    fn duplicate(&self) -> Option<Box<dyn Component>> {
        Some(Box::new(Marker(self.0)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Owner {
    generation: u64,
    origin: PathBuf,
}

impl CodeOwner for Owner {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn origin(&self) -> &Path {
        &self.origin
    }
}

fn lease(generation: u64) -> Lease {
    Lease::new(Arc::new(Owner {
        generation,
        origin: PathBuf::from("memory://test"),
    }))
}

fn container() -> (ComponentsContainer, Arc<AtomicBool>) {
    let active = Arc::new(AtomicBool::new(true));
    (ComponentsContainer::new(active.clone()), active)
}

fn marker_value(container: &ComponentsContainer, name: &str) -> Option<u32> {
    container
        .get(name)
        .and_then(|cell| cell.lock().downcast_ref::<Marker>().map(|m| m.0))
}

#[test]
fn test_type_key_is_per_generation() {
    assert_eq!(TypeKey::new(1, "Orbit"), TypeKey::new(1, "Orbit"));
    assert_ne!(TypeKey::new(1, "Orbit"), TypeKey::new(2, "Orbit"));
    assert_ne!(TypeKey::new(1, "Orbit"), TypeKey::new(1, "Spin"));
}

#[test]
fn test_component_box_metadata() {
    let plain = ComponentBox::plain("Marker", Marker(1));
    assert_eq!(plain.type_name(), "Marker");
    assert_eq!(plain.kind(), ComponentKind::Plain);
    assert!(!plain.is_script());
    assert_eq!(plain.generation(), None);

    let script = ComponentBox::script("Orbit", Marker(2)).with_lease(lease(3));
    assert!(script.is_script());
    assert_eq!(script.generation(), Some(3));

    let copy = script.try_duplicate().unwrap();
    assert_eq!(copy.generation(), Some(3));
    assert_eq!(copy.downcast_ref::<Marker>().unwrap().0, 2);
}

#[test]
fn test_staged_addition_invisible_until_sync() {
    let (container, _) = container();
    container.stage_add("Marker", ComponentBox::plain("Marker", Marker(1)));

    assert!(container.get("Marker").is_none());
    assert!(container.has_pending());

    let outcome = container.sync();
    assert_eq!(outcome.added.len(), 1);
    assert_eq!(marker_value(&container, "Marker"), Some(1));
    assert!(!container.has_pending());
}

#[test]
fn test_later_addition_supersedes_earlier() {
    let (container, _) = container();
    container.stage_add("Marker", ComponentBox::plain("Marker", Marker(1)));
    container.stage_add("Marker", ComponentBox::plain("Marker", Marker(2)));
    container.sync();

    assert_eq!(container.len(), 1);
    assert_eq!(marker_value(&container, "Marker"), Some(2));
}

#[test]
fn test_remove_cancels_pending_addition() {
    let (container, _) = container();
    container.stage_add("Marker", ComponentBox::plain("Marker", Marker(1)));
    container.stage_remove("Marker", true);

    let outcome = container.sync();
    assert!(outcome.is_empty());
    assert!(container.is_empty());
}

#[test]
fn test_cancel_keeps_existing_live_component() {
    let (container, _) = container();
    container.stage_add("Marker", ComponentBox::plain("Marker", Marker(1)));
    container.sync();

    container.stage_add("Marker", ComponentBox::plain("Marker", Marker(2)));
    container.stage_remove("Marker", true);
    let outcome = container.sync();

    assert!(outcome.is_empty());
    assert_eq!(marker_value(&container, "Marker"), Some(1));
}

#[test]
fn test_removal_applied_before_addition() {
    let (container, _) = container();
    container.stage_add("Marker", ComponentBox::plain("Marker", Marker(1)));
    container.sync();

    container.stage_remove("Marker", true);
    container.stage_add("Marker", ComponentBox::plain("Marker", Marker(2)));
    let outcome = container.sync();

    assert_eq!(outcome.removed, vec![("Marker".to_string(), true)]);
    assert_eq!(outcome.added.len(), 1);
    assert_eq!(marker_value(&container, "Marker"), Some(2));
}

#[test]
fn test_addition_replaces_live_component_at_sync() {
    let (container, _) = container();
    container.stage_add("A", ComponentBox::plain("A", Marker(1)));
    container.stage_add("B", ComponentBox::plain("B", Marker(1)));
    container.sync();

    container.stage_add("A", ComponentBox::plain("A", Marker(9)));
    let outcome = container.sync();

    assert_eq!(outcome.replaced, vec!["A".to_string()]);
    assert_eq!(container.len(), 2);
    assert_eq!(marker_value(&container, "A"), Some(9));
    // The replacement moves to the end of insertion order.
    assert_eq!(container.names(), vec!["B".to_string(), "A".to_string()]);
}

#[test]
fn test_snapshot_isolated_from_sync() {
    let (container, _) = container();
    container.stage_add("A", ComponentBox::plain("A", Marker(1)));
    container.sync();

    let before = container.snapshot();
    container.stage_remove("A", false);
    container.stage_add("B", ComponentBox::plain("B", Marker(2)));
    container.sync();

    assert_eq!(before.names(), vec!["A".to_string()]);
    assert_eq!(container.names(), vec!["B".to_string()]);
    assert!(before.get("B").is_none());
}

#[test]
fn test_active_values_follow_owner_and_enabled_flags() {
    let (container, active) = container();
    container.stage_add("A", ComponentBox::plain("A", Marker(1)));
    container.stage_add("B", ComponentBox::plain("B", Marker(2)));
    container.sync();

    assert_eq!(container.active_values().len(), 2);

    assert!(container.set_enabled("B", false));
    assert_eq!(container.is_enabled("B"), Some(false));
    assert_eq!(container.active_values().len(), 1);
    assert!(!container.set_enabled("missing", false));

    active.store(false, Ordering::Release);
    assert!(container.active_values().is_empty());
}

#[test]
fn test_take_now() {
    let (container, _) = container();
    container.stage_add("A", ComponentBox::plain("A", Marker(5)));
    container.sync();

    assert!(container.take_now("missing").unwrap().is_none());

    let held = container.snapshot();
    assert!(matches!(
        container.take_now("A"),
        Err(KernelError::ComponentBusy(_))
    ));
    assert!(container.contains("A"));
    drop(held);

    let taken = container.take_now("A").unwrap().unwrap();
    assert_eq!(taken.downcast_ref::<Marker>().unwrap().0, 5);
    assert!(container.is_empty());
}

#[test]
fn test_detach_generation_records_scripts_only() {
    let (container, _) = container();
    container.stage_add("Orbit", ComponentBox::script("Orbit", Marker(1)).with_lease(lease(1)));
    container.stage_add("Mesh", ComponentBox::plain("Mesh", Marker(1)).with_lease(lease(1)));
    container.stage_add("Host", ComponentBox::plain("Host", Marker(1)));
    container.sync();
    container.stage_add("Spin", ComponentBox::script("Spin", Marker(1)).with_lease(lease(1)));

    let mut detached = container.detach_generation(1);
    detached.sort();

    assert_eq!(
        detached,
        vec![
            ("Mesh".to_string(), ComponentKind::Plain),
            ("Orbit".to_string(), ComponentKind::Script),
            ("Spin".to_string(), ComponentKind::Script),
        ]
    );
    assert_eq!(container.names(), vec!["Host".to_string()]);
    assert!(!container.has_pending());

    let mut migration = container.migration_list();
    migration.sort();
    assert_eq!(migration, vec!["Orbit".to_string(), "Spin".to_string()]);
}

#[test]
fn test_detach_other_generation_is_noop() {
    let (container, _) = container();
    container.stage_add("Orbit", ComponentBox::script("Orbit", Marker(1)).with_lease(lease(2)));
    container.sync();

    assert!(container.detach_generation(1).is_empty());
    assert!(container.contains("Orbit"));
    assert!(container.migration_list().is_empty());
}

#[test]
fn test_migration_list_operations() {
    let (container, _) = container();
    container.record_migration("Orbit");
    container.record_migration("Orbit");
    container.record_migration("Spin");
    assert_eq!(container.migration_list(), vec!["Orbit", "Spin"]);

    container.retain_migration(|name| name != "Orbit");
    assert_eq!(container.migration_list(), vec!["Spin"]);

    container.clear_migration();
    assert!(container.migration_list().is_empty());
}

#[test]
fn test_clear_drops_live_staged_and_migration() {
    let owner = Arc::new(Owner {
        generation: 1,
        origin: PathBuf::from("memory://test"),
    });
    let leased = |name: &str| {
        ComponentBox::script(name, Marker(1)).with_lease(Lease::new(owner.clone()))
    };
    let (container, _) = container();
    container.stage_add("Orbit", leased("Orbit"));
    container.sync();
    container.stage_add("Spin", leased("Spin"));
    container.record_migration("Trail");
    assert_eq!(Arc::strong_count(&owner), 3);

    let cleared = container.clear();
    assert_eq!(
        cleared,
        vec![
            ("Orbit".to_string(), ComponentKind::Script),
            ("Spin".to_string(), ComponentKind::Script),
        ]
    );
    assert!(container.is_empty());
    assert!(!container.has_pending());
    assert!(container.migration_list().is_empty());
    assert_eq!(Arc::strong_count(&owner), 1);
}
