//! Hypervisor commands: one ephemeral object per requested lifecycle
//! operation, binding a capsule record to the backend call it must make,
//! the state transition applied on success, and the compensating transition
//! applied when the operation is abandoned after retries.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use capsule_core::error::{ErrorKind, Result};
use capsule_hypervisor::Hypervisor;

use crate::retry::RetriableTask;
use crate::state::StateMachine;
use crate::store::CapsuleStore;

mod create;
mod delete;
mod keys;
mod migrate;
mod power;

pub use create::CreateVmCommand;
pub use delete::DeleteVmCommand;
pub use keys::{
    AddShareesCommand, DeletePublicKeyCommand, UpdateCustosCredsCommand, UpdatePublicKeyCommand,
};
pub use migrate::MigrateVmCommand;
pub use power::{QueryVmCommand, StartVmCommand, StopVmCommand, SwitchVmCommand};

/// Failure kinds the dispatcher retries by default: transient infrastructure
/// faults only, never a definitive backend rejection.
pub(crate) const TRANSIENT_KINDS: &[ErrorKind] =
    &[ErrorKind::Transport, ErrorKind::Io, ErrorKind::Database];

/// Everything a command needs to execute, injected by the process that owns
/// the dispatcher. Commands never reach for ambient globals.
#[derive(Clone)]
pub struct CommandContext {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub store: CapsuleStore,
    pub state: StateMachine,
    /// Wraps the persistence writes a command performs after its backend
    /// call succeeded, so a transient store fault does not fail the
    /// already-completed operation.
    pub db_retry: RetriableTask,
}

impl CommandContext {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, store: CapsuleStore, state: StateMachine) -> Self {
        Self {
            hypervisor,
            store,
            state,
            db_retry: RetriableTask::for_store_writes(),
        }
    }

    pub fn with_db_retry(mut self, db_retry: RetriableTask) -> Self {
        self.db_retry = db_retry;
        self
    }
}

/// One requested lifecycle operation.
///
/// `execute` is run by a dispatcher worker under the retry executor; when it
/// fails terminally, `cleanup_on_failed` drives the capsule's persisted
/// state to `Error` from whatever state it held when the command started.
#[async_trait]
pub trait HypervisorCommand: Send + Sync + fmt::Display {
    async fn execute(&self, ctx: &CommandContext) -> Result<()>;

    async fn cleanup_on_failed(&self, ctx: &CommandContext) -> Result<()>;

    /// Failure kinds the dispatcher may retry for this command.
    fn retryable_kinds(&self) -> &[ErrorKind] {
        TRANSIENT_KINDS
    }
}
