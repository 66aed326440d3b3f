use std::fmt;

use async_trait::async_trait;
use capsule_core::capsule::{Capsule, VmState};
use capsule_core::error::Result;
use capsule_hypervisor::codes;
use tracing::info;

use super::{CommandContext, HypervisorCommand};

/// Tear down the backend resource and settle the books: remove the record,
/// mark the ownership link deleted, and restore the owner's quota.
///
/// The invariant being protected is "no orphaned billing/quota", not "the
/// backend call was issued exactly once": a backend report that the VM is
/// already gone counts as success, so a partially completed earlier delete
/// can safely be re-run.
pub struct DeleteVmCommand {
    capsule: Capsule,
    username: String,
}

impl DeleteVmCommand {
    pub fn new(capsule: Capsule, username: impl Into<String>) -> Self {
        Self {
            capsule,
            username: username.into(),
        }
    }
}

#[async_trait]
impl HypervisorCommand for DeleteVmCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let resp = ctx.hypervisor.delete(&self.capsule).await?;

        if resp.code == codes::VM_NOT_EXIST {
            info!(
                vm_id = %self.capsule.vm_id,
                "backend resource already gone, continuing with record cleanup"
            );
        } else {
            resp.into_result()?;
        }

        // No state update: the record is about to disappear. Quota restore
        // and link marking happen in the same transaction as the removal.
        ctx.db_retry
            .run(|| ctx.store.delete_capsule(&self.username, &self.capsule))
            .await
    }

    async fn cleanup_on_failed(&self, ctx: &CommandContext) -> Result<()> {
        ctx.state
            .transit_to(
                &self.capsule.vm_id,
                VmState::Deleting,
                VmState::Error,
                Some(&self.username),
            )
            .await
    }
}

impl fmt::Display for DeleteVmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deletevm {}", self.capsule.vm_id)
    }
}
