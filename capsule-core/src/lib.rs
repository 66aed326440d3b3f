//! Shared foundation for the capsule service.
//!
//! This crate holds what every other layer needs: the capsule domain model
//! (VM record, state, mode, quota), the service-wide error type, logging
//! setup, and process configuration. It has no orchestration logic of its
//! own; the backend contract lives in `capsule-hypervisor` and the lifecycle
//! engine in `capsule-orchestrator`.

pub mod capsule;
pub mod config;
pub mod error;
pub mod logging;

pub use capsule::{Capsule, CreateCapsuleRequest, Quota, VmMode, VmPorts, VmState};
pub use config::Config;
pub use error::{CapsuleError, ErrorKind, Result};
