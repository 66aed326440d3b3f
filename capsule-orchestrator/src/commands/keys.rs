use std::fmt;

use async_trait::async_trait;
use capsule_core::capsule::{Capsule, VmState};
use capsule_core::error::Result;
use tracing::debug;

use super::{CommandContext, HypervisorCommand};

/// Push a user's (possibly rotated) public key to the backend.
pub struct UpdatePublicKeyCommand {
    capsule: Capsule,
    user_id: String,
    pub_key: String,
}

impl UpdatePublicKeyCommand {
    pub fn new(capsule: Capsule, user_id: impl Into<String>, pub_key: impl Into<String>) -> Self {
        Self {
            capsule,
            user_id: user_id.into(),
            pub_key: pub_key.into(),
        }
    }
}

#[async_trait]
impl HypervisorCommand for UpdatePublicKeyCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        ctx.hypervisor
            .update_pub_key(&self.capsule, &self.pub_key, &self.user_id)
            .await?
            .into_result()?;
        Ok(())
    }

    async fn cleanup_on_failed(&self, ctx: &CommandContext) -> Result<()> {
        ctx.state
            .transit_to(
                &self.capsule.vm_id,
                self.capsule.state,
                VmState::Error,
                Some(&self.user_id),
            )
            .await
    }
}

impl fmt::Display for UpdatePublicKeyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "updatekey {}", self.capsule.vm_id)
    }
}

/// Revoke a user's public key on the backend.
pub struct DeletePublicKeyCommand {
    capsule: Capsule,
    user_id: String,
    pub_key: String,
}

impl DeletePublicKeyCommand {
    pub fn new(capsule: Capsule, user_id: impl Into<String>, pub_key: impl Into<String>) -> Self {
        Self {
            capsule,
            user_id: user_id.into(),
            pub_key: pub_key.into(),
        }
    }
}

#[async_trait]
impl HypervisorCommand for DeletePublicKeyCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        ctx.hypervisor
            .delete_pub_key(&self.capsule, &self.pub_key, &self.user_id)
            .await?
            .into_result()?;
        Ok(())
    }

    async fn cleanup_on_failed(&self, ctx: &CommandContext) -> Result<()> {
        ctx.state
            .transit_to(
                &self.capsule.vm_id,
                self.capsule.state,
                VmState::Error,
                Some(&self.user_id),
            )
            .await
    }
}

impl fmt::Display for DeletePublicKeyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deletekey {}", self.capsule.vm_id)
    }
}

/// Rotate the Custos client credentials baked into the capsule.
pub struct UpdateCustosCredsCommand {
    capsule: Capsule,
    client_id: String,
    client_secret: String,
}

impl UpdateCustosCredsCommand {
    pub fn new(
        capsule: Capsule,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            capsule,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl HypervisorCommand for UpdateCustosCredsCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        ctx.hypervisor
            .update_custos_creds(&self.capsule, &self.client_id, &self.client_secret)
            .await?
            .into_result()?;
        Ok(())
    }

    async fn cleanup_on_failed(&self, ctx: &CommandContext) -> Result<()> {
        ctx.state
            .transit_to(&self.capsule.vm_id, self.capsule.state, VmState::Error, None)
            .await
    }
}

impl fmt::Display for UpdateCustosCredsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "updatecreds {}", self.capsule.vm_id)
    }
}

/// Grant additional users access to a full-access capsule by pushing each
/// approved sharee's public key to the backend.
pub struct AddShareesCommand {
    capsule: Capsule,
    operator: String,
    sharee_keys: Vec<String>,
}

impl AddShareesCommand {
    pub fn new(capsule: Capsule, operator: impl Into<String>, sharee_keys: Vec<String>) -> Self {
        Self {
            capsule,
            operator: operator.into(),
            sharee_keys,
        }
    }
}

#[async_trait]
impl HypervisorCommand for AddShareesCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        for key in &self.sharee_keys {
            ctx.hypervisor
                .update_pub_key(&self.capsule, key, &self.operator)
                .await?
                .into_result()?;
            debug!(vm_id = %self.capsule.vm_id, "sharee key pushed");
        }
        Ok(())
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

impl fmt::Display for AddShareesCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addsharees {} ({} keys)",
            self.capsule.vm_id,
            self.sharee_keys.len()
        )
    }
}
