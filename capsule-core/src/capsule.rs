use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a capsule as persisted in the store.
///
/// Transitions are only legal along [`VmState::can_transit_to`]; the state
/// machine in `capsule-orchestrator` enforces the table with an atomic
/// compare-and-set against the persisted row. `Deleting` terminates with
/// record removal rather than a further persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    CreatePending,
    Running,
    Shutdown,
    Migrating,
    Deleting,
    Error,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::CreatePending => "create_pending",
            VmState::Running => "running",
            VmState::Shutdown => "shutdown",
            VmState::Migrating => "migrating",
            VmState::Deleting => "deleting",
            VmState::Error => "error",
        }
    }

    /// The canonical transition table.
    pub fn can_transit_to(self, to: VmState) -> bool {
        use VmState::*;
        match (self, to) {
            // Any in-flight state may be driven to Error by a failing
            // command's cleanup path.
            (_, Error) => true,
            (CreatePending, Running) => true,
            (Running, Shutdown) | (Shutdown, Running) => true,
            (Running, Migrating) => true,
            (Migrating, Shutdown) => true,
            (Running, Deleting) | (Shutdown, Deleting) | (Error, Deleting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode of a capsule, orthogonal to its lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VmMode {
    NotDefined,
    Secure,
    Maintenance,
}

impl VmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmMode::NotDefined => "not_defined",
            VmMode::Secure => "secure",
            VmMode::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for VmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network location of a capsule: where it is reachable and on which ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPorts {
    pub public_ip: String,
    pub ssh_port: u16,
    pub vnc_port: u16,
}

/// A per-user resource budget, also used for the footprint of a single
/// capsule when reserving or restoring quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub disk_gb: i64,
    pub cpu: i64,
    pub memory_mb: i64,
}

impl Quota {
    /// All three dimensions simultaneously satisfiable.
    pub fn covers(&self, request: &Quota) -> bool {
        self.disk_gb >= request.disk_gb
            && self.cpu >= request.cpu
            && self.memory_mb >= request.memory_mb
    }
}

/// A provisioned VM as recorded in the persistence store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capsule {
    pub vm_id: String,
    pub owner: String,
    pub state: VmState,
    pub mode: VmMode,
    pub public_ip: String,
    pub ssh_port: u16,
    pub vnc_port: u16,
    pub vnc_username: String,
    pub vnc_password: String,
    pub working_dir: String,
    pub image_name: String,
    pub num_cpus: i64,
    pub memory_size_mb: i64,
    pub disk_space_gb: i64,
    /// Capsule sharing tier; `None` means full access was never requested.
    pub full_access: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Capsule {
    /// The quota this capsule holds against its owner.
    pub fn quota_footprint(&self) -> Quota {
        Quota {
            disk_gb: self.disk_space_gb,
            cpu: self.num_cpus,
            memory_mb: self.memory_size_mb,
        }
    }

    pub fn ports(&self) -> VmPorts {
        VmPorts {
            public_ip: self.public_ip.clone(),
            ssh_port: self.ssh_port,
            vnc_port: self.vnc_port,
        }
    }
}

/// Everything the request layer must supply to create a capsule record.
/// The VM id is externally assigned and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCapsuleRequest {
    pub vm_id: String,
    pub username: String,
    pub image_name: String,
    pub vnc_username: String,
    pub vnc_password: String,
    pub host: VmPorts,
    pub working_dir: String,
    pub num_cpus: i64,
    pub memory_size_mb: i64,
    pub disk_space_gb: i64,
}

impl CreateCapsuleRequest {
    pub fn quota_footprint(&self) -> Quota {
        Quota {
            disk_gb: self.disk_space_gb,
            cpu: self.num_cpus,
            memory_mb: self.memory_size_mb,
        }
    }
}
