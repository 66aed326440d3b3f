//! Capsule lifecycle orchestration engine.
//!
//! This crate contains the core business logic for provisioning, operating,
//! and tearing down capsules against a pluggable hypervisor backend: the VM
//! state machine, the quota-guarded persistence store, the retry executor,
//! the hypervisor command variants, and the dispatcher that drains them
//! asynchronously. It is consumed by the request-handling layer but can also
//! be driven by CLI commands or background workers.

pub mod commands;
pub mod db;
pub mod dispatcher;
pub mod provision;
pub mod retry;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use capsule_core::capsule::{Capsule, CreateCapsuleRequest, Quota, VmMode, VmPorts, VmState};
pub use capsule_core::error::{CapsuleError, ErrorKind, Result};
pub use commands::{
    AddShareesCommand, CommandContext, CreateVmCommand, DeletePublicKeyCommand, DeleteVmCommand,
    HypervisorCommand, MigrateVmCommand, QueryVmCommand, StartVmCommand, StopVmCommand,
    SwitchVmCommand, UpdateCustosCredsCommand, UpdatePublicKeyCommand,
};
pub use dispatcher::{CommandDispatcher, DispatcherConfig};
pub use retry::RetriableTask;
pub use state::StateMachine;
pub use store::CapsuleStore;
