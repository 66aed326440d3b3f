use std::fmt;

use async_trait::async_trait;
use capsule_core::capsule::{Capsule, VmState};
use capsule_core::error::Result;
use tracing::debug;

use super::{CommandContext, HypervisorCommand};

/// Provision the backend resource for a freshly inserted capsule record and
/// boot it. On success the record moves CreatePending -> Running.
pub struct CreateVmCommand {
    capsule: Capsule,
    username: String,
    pub_key: String,
}

impl CreateVmCommand {
    pub fn new(capsule: Capsule, username: impl Into<String>, pub_key: impl Into<String>) -> Self {
        Self {
            capsule,
            username: username.into(),
            pub_key: pub_key.into(),
        }
    }
}

#[async_trait]
impl HypervisorCommand for CreateVmCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let resp = ctx
            .hypervisor
            .create_vm(&self.capsule, &self.pub_key, &self.username)
            .await?
            .into_result()?;
        debug!(vm_id = %self.capsule.vm_id, %resp, "create succeeded");

        let resp = ctx.hypervisor.launch_vm(&self.capsule).await?.into_result()?;
        debug!(vm_id = %self.capsule.vm_id, %resp, "launch succeeded");

        ctx.db_retry
            .run(|| {
                ctx.state.transit_to(
                    &self.capsule.vm_id,
                    VmState::CreatePending,
                    VmState::Running,
                    Some(&self.username),
                )
            })
            .await
    }

    async fn cleanup_on_failed(&self, ctx: &CommandContext) -> Result<()> {
        ctx.state
            .transit_to(
                &self.capsule.vm_id,
                self.capsule.state,
                VmState::Error,
                Some(&self.username),
            )
            .await
    }
}

impl fmt::Display for CreateVmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "createvm {}", self.capsule.vm_id)
    }
}
