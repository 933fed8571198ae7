//! World-wide dispatch
//!
//! Entities are independent units of work on the rayon pool. Components of a
//! single entity always run sequentially on one worker.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::entity::{Entity, EntityId, EntityReport};
use crate::error::{KernelError, KernelResult};
use crate::world::World;

/// Summary of one dispatch pass over many entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Entities the pass visited.
    pub dispatched: usize,
    /// Hook invocations across all entities.
    pub invoked: usize,
    /// Reports of entities with at least one failing component.
    pub failures: Vec<EntityReport>,
}

impl DispatchReport {
    fn collect(reports: Vec<EntityReport>) -> Self {
        let mut summary = DispatchReport {
            dispatched: reports.len(),
            ..Default::default()
        };
        for report in reports {
            summary.invoked += report.invoked;
            if !report.is_ok() {
                summary.failures.push(report);
            }
        }
        summary.failures.sort_by_key(|r| r.entity);
        summary
    }

    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.iter().map(|r| r.failures.len()).sum()
    }
}

/// Result of delivering one collision to both participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionOutcome {
    pub a: EntityReport,
    pub b: EntityReport,
    /// Either side had a failing component. The notification is not retried.
    pub degraded: bool,
}

impl World {
    /// Start every entity that has not been initialized yet.
    pub fn start_all(&self) -> DispatchReport {
        let pending: Vec<Arc<Entity>> = self
            .entities()
            .into_iter()
            .filter(|e| !e.is_initialized())
            .collect();
        let reports: Vec<EntityReport> = pending.par_iter().map(|e| e.start()).collect();
        let report = DispatchReport::collect(reports);
        debug!("start_all: {} entities started", report.dispatched);
        report
    }

    /// Update every active, initialized entity in parallel.
    pub fn update_all(&self, dt: f32) -> DispatchReport {
        let table = self.snapshot();
        let reports: Vec<EntityReport> = table
            .par_iter()
            .filter(|(_, e)| e.is_active() && e.is_initialized())
            .map(|(_, e)| e.update(dt))
            .collect();
        let report = DispatchReport::collect(reports);
        if !report.is_ok() {
            warn!(
                "update_all: {} component failures on {} entities",
                report.failure_count(),
                report.failures.len()
            );
        }
        report
    }

    /// Notify both sides of a collision as two joined units of work.
    pub fn dispatch_collision(&self, a: EntityId, b: EntityId) -> KernelResult<CollisionOutcome> {
        let first = self.get(a).ok_or(KernelError::EntityNotFound(a))?;
        let second = self.get(b).ok_or(KernelError::EntityNotFound(b))?;

        let (a_report, b_report) =
            rayon::join(|| first.on_collision(b), || second.on_collision(a));

        let degraded = !a_report.is_ok() || !b_report.is_ok();
        if degraded {
            warn!("Collision {} <-> {} delivered degraded", a, b);
        }
        Ok(CollisionOutcome {
            a: a_report,
            b: b_report,
            degraded,
        })
    }
}
