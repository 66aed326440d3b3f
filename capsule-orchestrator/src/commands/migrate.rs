use std::fmt;

use async_trait::async_trait;
use capsule_core::capsule::{Capsule, VmPorts, VmState};
use capsule_core::error::Result;
use tracing::debug;

use super::{CommandContext, HypervisorCommand};

/// Move a capsule to a new host. On success the record lands in Shutdown
/// with its host and ports rewritten; on failure the location fields are
/// left untouched and cleanup drives the state to Error.
pub struct MigrateVmCommand {
    capsule: Capsule,
    operator: String,
    target: VmPorts,
}

impl MigrateVmCommand {
    pub fn new(capsule: Capsule, operator: impl Into<String>, target: VmPorts) -> Self {
        Self {
            capsule,
            operator: operator.into(),
            target,
        }
    }
}

#[async_trait]
impl HypervisorCommand for MigrateVmCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        ctx.hypervisor
            .migrate_vm(&self.capsule, &self.target)
            .await?
            .into_result()?;

        debug!(
            vm_id = %self.capsule.vm_id,
            host = %self.target.public_ip,
            ssh_port = self.target.ssh_port,
            vnc_port = self.target.vnc_port,
            "migration succeeded, rewriting location"
        );

        // Transition and location rewrite complete together or the command
        // is not declared successful.
        ctx.db_retry
            .run(|| async {
                ctx.state
                    .transit_to(
                        &self.capsule.vm_id,
                        self.capsule.state,
                        VmState::Shutdown,
                        Some(&self.operator),
                    )
                    .await?;
                ctx.store
                    .update_host_and_ports(&self.capsule.vm_id, &self.target)
                    .await
            })
            .await
    }

    async fn cleanup_on_failed(&self, ctx: &CommandContext) -> Result<()> {
        ctx.state
            .transit_to(
                &self.capsule.vm_id,
                self.capsule.state,
                VmState::Error,
                Some(&self.operator),
            )
            .await
    }
}

impl fmt::Display for MigrateVmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "migratevm {}", self.capsule.vm_id)
    }
}
