use std::fmt;

use async_trait::async_trait;
use capsule_core::capsule::{Capsule, VmMode, VmState};
use capsule_core::error::Result;
use tracing::info;

use super::{CommandContext, HypervisorCommand};

/// Boot a stopped capsule: Shutdown -> Running.
pub struct StartVmCommand {
    capsule: Capsule,
    username: String,
}

impl StartVmCommand {
    pub fn new(capsule: Capsule, username: impl Into<String>) -> Self {
        Self {
            capsule,
            username: username.into(),
        }
    }
}

#[async_trait]
impl HypervisorCommand for StartVmCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        ctx.hypervisor.launch_vm(&self.capsule).await?.into_result()?;

        ctx.db_retry
            .run(|| {
                ctx.state.transit_to(
                    &self.capsule.vm_id,
                    VmState::Shutdown,
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

impl fmt::Display for StartVmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "startvm {}", self.capsule.vm_id)
    }
}

/// Power a capsule down: Running -> Shutdown, mode back to NotDefined.
pub struct StopVmCommand {
    capsule: Capsule,
    username: String,
}

impl StopVmCommand {
    pub fn new(capsule: Capsule, username: impl Into<String>) -> Self {
        Self {
            capsule,
            username: username.into(),
        }
    }
}

#[async_trait]
impl HypervisorCommand for StopVmCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        ctx.hypervisor.stop_vm(&self.capsule).await?.into_result()?;

        ctx.db_retry
            .run(|| async {
                ctx.state
                    .transit_to(
                        &self.capsule.vm_id,
                        VmState::Running,
                        VmState::Shutdown,
                        Some(&self.username),
                    )
                    .await?;
                ctx.state
                    .update_mode(&self.capsule.vm_id, VmMode::NotDefined)
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
                Some(&self.username),
            )
            .await
    }
}

impl fmt::Display for StopVmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stopvm {}", self.capsule.vm_id)
    }
}

/// Switch a running capsule between secure and maintenance mode. The state
/// is unchanged; only the persisted mode moves.
pub struct SwitchVmCommand {
    capsule: Capsule,
    username: String,
    target_mode: VmMode,
}

impl SwitchVmCommand {
    pub fn new(capsule: Capsule, username: impl Into<String>, target_mode: VmMode) -> Self {
        Self {
            capsule,
            username: username.into(),
            target_mode,
        }
    }
}

#[async_trait]
impl HypervisorCommand for SwitchVmCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        ctx.hypervisor
            .switch_vm(&self.capsule, self.target_mode)
            .await?
            .into_result()?;

        ctx.db_retry
            .run(|| ctx.state.update_mode(&self.capsule.vm_id, self.target_mode))
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

impl fmt::Display for SwitchVmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "switchvm {} -> {}", self.capsule.vm_id, self.target_mode)
    }
}

/// Liveness probe against the backend. Persists nothing on success; a
/// terminally unreachable capsule is marked Error like any other command.
pub struct QueryVmCommand {
    capsule: Capsule,
}

impl QueryVmCommand {
    pub fn new(capsule: Capsule) -> Self {
        Self { capsule }
    }
}

#[async_trait]
impl HypervisorCommand for QueryVmCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let resp = ctx.hypervisor.query_vm(&self.capsule).await?.into_result()?;
        info!(vm_id = %self.capsule.vm_id, %resp, "backend query");
        Ok(())
    }

    async fn cleanup_on_failed(&self, ctx: &CommandContext) -> Result<()> {
        ctx.state
            .transit_to(&self.capsule.vm_id, self.capsule.state, VmState::Error, None)
            .await
    }
}

impl fmt::Display for QueryVmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queryvm {}", self.capsule.vm_id)
    }
}
