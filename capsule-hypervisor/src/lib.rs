//! Hypervisor backend abstraction.
//!
//! Defines the capability contract every compute backend must satisfy: one
//! method per physical operation, each returning a [`HypervisorResponse`]
//! with an integer code (0 = success) and free-text diagnostic detail.
//! Transport-level failures surface as [`CapsuleError::Transport`] and are
//! treated as retryable by the orchestration layer; a non-zero response code
//! is a definitive rejection and is not.
//!
//! Concrete remote backends (OpenStack et al.) live outside this workspace;
//! the in-memory simulator used by tests is behind the `test-helpers`
//! feature.

use std::fmt;

use async_trait::async_trait;
use capsule_core::capsule::{Capsule, VmMode, VmPorts};
use capsule_core::error::{CapsuleError, Result};

#[cfg(any(test, feature = "test-helpers"))]
pub mod simulator;

/// Error codes a backend may return in a non-zero [`HypervisorResponse`].
pub mod codes {
    pub const INVALID_INPUT_ARGS: i32 = 1;
    pub const IMAGE_NOT_EXIST: i32 = 2;
    pub const NOT_ENOUGH_CPU: i32 = 3;
    pub const NOT_ENOUGH_MEM: i32 = 4;
    pub const IO_ERR: i32 = 5;
    pub const VM_NOT_EXIST: i32 = 6;
    pub const FIREWALL_POLICY_NOT_EXIST: i32 = 7;
    pub const INVALID_VM_MODE: i32 = 8;
}

/// Outcome of one backend operation.
#[derive(Debug, Clone)]
pub struct HypervisorResponse {
    pub code: i32,
    pub detail: String,
}

impl HypervisorResponse {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            code: 0,
            detail: detail.into(),
        }
    }

    pub fn failure(code: i32, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Convert a non-zero response into a definitive backend rejection.
    pub fn into_result(self) -> Result<HypervisorResponse> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CapsuleError::Backend {
                code: self.code,
                detail: self.detail,
            })
        }
    }
}

impl fmt::Display for HypervisorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} detail={}", self.code, self.detail)
    }
}

/// The capability set every hypervisor backend implements.
///
/// Callers depend only on this trait, never on a concrete backend type.
/// Every call may also fail at the transport level, which the orchestration
/// layer treats as retryable.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Short backend identifier (e.g. "openstack", "simulator").
    fn name(&self) -> &'static str;

    async fn create_vm(
        &self,
        capsule: &Capsule,
        pub_key: &str,
        user_id: &str,
    ) -> Result<HypervisorResponse>;

    async fn launch_vm(&self, capsule: &Capsule) -> Result<HypervisorResponse>;

    async fn query_vm(&self, capsule: &Capsule) -> Result<HypervisorResponse>;

    async fn switch_vm(&self, capsule: &Capsule, target_mode: VmMode)
        -> Result<HypervisorResponse>;

    async fn stop_vm(&self, capsule: &Capsule) -> Result<HypervisorResponse>;

    async fn delete(&self, capsule: &Capsule) -> Result<HypervisorResponse>;

    async fn update_pub_key(
        &self,
        capsule: &Capsule,
        pub_key: &str,
        user_id: &str,
    ) -> Result<HypervisorResponse>;

    async fn delete_pub_key(
        &self,
        capsule: &Capsule,
        pub_key: &str,
        user_id: &str,
    ) -> Result<HypervisorResponse>;

    async fn update_custos_creds(
        &self,
        capsule: &Capsule,
        client_id: &str,
        client_secret: &str,
    ) -> Result<HypervisorResponse>;

    async fn migrate_vm(&self, capsule: &Capsule, target: &VmPorts)
        -> Result<HypervisorResponse>;
}
