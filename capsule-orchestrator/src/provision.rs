//! Synchronous pre-enqueue steps.
//!
//! Once a command is enqueued its outcome is invisible to the caller, so
//! everything checkable up front (quota, current state) is settled here,
//! before a command object exists.

use capsule_core::capsule::{Capsule, CreateCapsuleRequest, VmState};
use capsule_core::error::Result;
use tracing::error;

use crate::state::StateMachine;
use crate::store::CapsuleStore;

/// Reserve the requested quota and insert the CreatePending record with its
/// ownership link. Quota violations surface here, synchronously; if the
/// insert fails after the reservation was taken, the reservation is handed
/// back.
pub async fn prepare_capsule(
    store: &CapsuleStore,
    req: &CreateCapsuleRequest,
) -> Result<Capsule> {
    let footprint = req.quota_footprint();
    store.reserve_quota(&req.username, &footprint).await?;

    match store.insert_capsule(req).await {
        Ok(capsule) => Ok(capsule),
        Err(err) => {
            if let Err(restore_err) = store.restore_quota(&req.username, &footprint).await {
                error!(
                    vm_id = %req.vm_id,
                    error = %restore_err,
                    "failed to hand back quota reservation after insert failure"
                );
            }
            Err(err)
        }
    }
}

/// Move the capsule into Deleting before a delete command is enqueued.
/// Returns the record as the command must see it.
pub async fn prepare_delete(
    state: &StateMachine,
    capsule: &Capsule,
    actor: Option<&str>,
) -> Result<Capsule> {
    state
        .transit_to(&capsule.vm_id, capsule.state, VmState::Deleting, actor)
        .await?;

    let mut staged = capsule.clone();
    staged.state = VmState::Deleting;
    Ok(staged)
}

/// Move the capsule into Migrating before a migrate command is enqueued.
pub async fn prepare_migrate(
    state: &StateMachine,
    capsule: &Capsule,
    actor: Option<&str>,
) -> Result<Capsule> {
    state
        .transit_to(&capsule.vm_id, capsule.state, VmState::Migrating, actor)
        .await?;

    let mut staged = capsule.clone();
    staged.state = VmState::Migrating;
    Ok(staged)
}
