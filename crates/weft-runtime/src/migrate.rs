//! Migration of ULTs between pools and their consumer streams.
//!
//! A migration is requested by any agent with [`migrate_to`] and carried
//! out by the dispatcher of the unit's current stream at the unit's next
//! hand-off — a unit is never moved while it is RUNNING. The hand-off push
//! into the target pool is the one pool mutation permitted concurrently
//! with the target consumer's pops.

use crate::error::{Result, RuntimeError};
use crate::pool::Pool;
use crate::registry;
use crate::request::{ULT_REQ_MIGRATE, ULT_REQ_ORPHAN};
use crate::stream::{ExecutionStream, StreamState};
use crate::ult::{Ult, UltState};
use crate::unit::WorkUnit;
use std::sync::Arc;

/// Ask for `ult` to move to `target` at its next hand-off.
///
/// The request is counted against the unit's *current* (source) pool until
/// the hand-off completes. If the target pool has no consumer when the
/// migration happens, the unit is pushed anyway and marked orphaned until
/// a consumer is bound.
pub fn migrate_to(ult: &Arc<Ult>, target: &Arc<dyn Pool>) -> Result<()> {
    if !registry::is_initialized() {
        return Err(RuntimeError::Uninitialized);
    }
    if ult.state() == UltState::Terminated {
        return Err(RuntimeError::InvalidUnit("unit already terminated"));
    }
    let source = ult
        .pool_upgrade()
        .ok_or(RuntimeError::InvalidPool("unit has no source pool"))?;

    let mut attrs = ult.attr_state();
    // A repeated request before the hand-off replaces the target; the
    // source pool counts the migration once.
    if !ult.request.any(ULT_REQ_MIGRATE) {
        source.inc_inflight_migrations();
    }
    attrs.migrate_target = Some(target.clone());
    ult.request.set(ULT_REQ_MIGRATE);
    Ok(())
}

/// Carry out a pending migration. Called by the dispatcher when it
/// observes the MIGRATE bit; the unit has been popped and is not running.
pub(crate) fn execute(stream: &Arc<ExecutionStream>, ult: &Arc<Ult>) -> Result<()> {
    let source = ult.pool_upgrade();

    let target = {
        let mut attrs = ult.attr_state();
        // The user callback runs under the unit's lock; it must not mutate
        // the same unit's attributes.
        if let Some(callback) = attrs.migration_callback.take() {
            callback(ult);
            attrs.migration_callback = Some(callback);
        }
        let target = attrs.migrate_target.take();
        ult.request.clear(ULT_REQ_MIGRATE);
        target
    };
    let Some(target) = target else {
        return Err(RuntimeError::InvalidPool("migration request without a target pool"));
    };

    let dest = target.consumer();
    if dest.is_none() {
        // No consumer yet: orphaned until one is bound and dispatches it.
        ult.request.set(ULT_REQ_ORPHAN);
    }

    ult.bind_pool(&target);
    ult.set_state(UltState::Ready);
    target.push(WorkUnit::Ult(ult.clone()));

    if let Some(source) = source {
        source.dec_inflight_migrations();
    }

    log::debug!(
        "[ES{}] ULT {} migrated to ES{:?}",
        stream.rank(),
        ult.id().as_u64(),
        dest.as_ref().map(|d| d.rank()),
    );

    if let Some(dest) = dest {
        if dest.state() == StreamState::Created {
            dest.start()?;
        }
    }
    Ok(())
}
