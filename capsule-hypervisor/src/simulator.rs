//! In-memory hypervisor used by tests.
//!
//! Tracks which VMs exist on the "backend" and whether they are running, so
//! lifecycle sequencing bugs (launching a VM that was never created,
//! deleting one twice) show up as the documented error codes instead of
//! silent success. Fault injection covers both failure classes: scripted
//! transport errors (retryable) and scripted rejections (definitive).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use capsule_core::capsule::{Capsule, VmMode, VmPorts};
use capsule_core::error::{CapsuleError, Result};

use crate::{codes, Hypervisor, HypervisorResponse};

#[derive(Debug)]
struct SimVm {
    running: bool,
    mode: VmMode,
    pub_keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct SimState {
    images: HashSet<String>,
    vms: HashMap<String, SimVm>,
    /// Number of upcoming calls that fail at the transport level.
    transport_faults: u32,
    /// Scripted definitive rejections, consumed in order.
    rejections: VecDeque<(i32, String)>,
    calls: u64,
}

pub struct CapsuleSimulator {
    state: Mutex<SimState>,
}

impl CapsuleSimulator {
    pub fn new() -> Self {
        Self::with_images(["ubuntu-base"])
    }

    pub fn with_images<I, S>(images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(SimState {
                images: images.into_iter().map(Into::into).collect(),
                ..Default::default()
            }),
        }
    }

    /// Make the next `n` backend calls fail with a transport error.
    pub fn inject_transport_faults(&self, n: u32) {
        self.lock().transport_faults = n;
    }

    /// Make the next backend call return a non-zero response.
    pub fn inject_rejection(&self, code: i32, detail: impl Into<String>) {
        self.lock().rejections.push_back((code, detail.into()));
    }

    /// Total number of backend calls observed, fault-injected ones included.
    pub fn call_count(&self) -> u64 {
        self.lock().calls
    }

    pub fn vm_exists(&self, vm_id: &str) -> bool {
        self.lock().vms.contains_key(vm_id)
    }

    /// Whether `pub_key` is currently installed on the VM.
    pub fn vm_has_key(&self, vm_id: &str, pub_key: &str) -> bool {
        self.lock()
            .vms
            .get(vm_id)
            .is_some_and(|vm| vm.pub_keys.contains(pub_key))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("simulator state poisoned")
    }

    /// Runs the fault-injection gate, then the operation itself.
    fn call<F>(&self, op: F) -> Result<HypervisorResponse>
    where
        F: FnOnce(&mut SimState) -> HypervisorResponse,
    {
        let mut state = self.lock();
        state.calls += 1;

        if state.transport_faults > 0 {
            state.transport_faults -= 1;
            return Err(CapsuleError::Transport(
                "simulated connection reset".to_string(),
            ));
        }
        if let Some((code, detail)) = state.rejections.pop_front() {
            return Ok(HypervisorResponse::failure(code, detail));
        }

        Ok(op(&mut state))
    }
}

impl Default for CapsuleSimulator {
    fn default() -> Self {
        Self::new()
    }
}

fn vm_not_exist(vm_id: &str) -> HypervisorResponse {
    HypervisorResponse::failure(codes::VM_NOT_EXIST, format!("VM {} does not exist", vm_id))
}

#[async_trait]
impl Hypervisor for CapsuleSimulator {
    fn name(&self) -> &'static str {
        "simulator"
    }

    async fn create_vm(
        &self,
        capsule: &Capsule,
        _pub_key: &str,
        _user_id: &str,
    ) -> Result<HypervisorResponse> {
        self.call(|state| {
            if !state.images.contains(&capsule.image_name) {
                return HypervisorResponse::failure(
                    codes::IMAGE_NOT_EXIST,
                    format!("image {} does not exist", capsule.image_name),
                );
            }
            if state.vms.contains_key(&capsule.vm_id) {
                return HypervisorResponse::failure(
                    codes::INVALID_INPUT_ARGS,
                    format!("VM {} already exists", capsule.vm_id),
                );
            }
            state.vms.insert(
                capsule.vm_id.clone(),
                SimVm {
                    running: false,
                    mode: VmMode::NotDefined,
                    pub_keys: HashSet::new(),
                },
            );
            HypervisorResponse::success(format!("created {}", capsule.vm_id))
        })
    }

    async fn launch_vm(&self, capsule: &Capsule) -> Result<HypervisorResponse> {
        self.call(|state| match state.vms.get_mut(&capsule.vm_id) {
            None => vm_not_exist(&capsule.vm_id),
            Some(vm) => {
                vm.running = true;
                HypervisorResponse::success(format!("launched {}", capsule.vm_id))
            }
        })
    }

    async fn query_vm(&self, capsule: &Capsule) -> Result<HypervisorResponse> {
        self.call(|state| match state.vms.get(&capsule.vm_id) {
            None => vm_not_exist(&capsule.vm_id),
            Some(vm) => HypervisorResponse::success(format!(
                "vmstatus={} mode={}",
                if vm.running { "running" } else { "shutdown" },
                vm.mode
            )),
        })
    }

    async fn switch_vm(
        &self,
        capsule: &Capsule,
        target_mode: VmMode,
    ) -> Result<HypervisorResponse> {
        self.call(|state| match state.vms.get_mut(&capsule.vm_id) {
            None => vm_not_exist(&capsule.vm_id),
            Some(vm) => {
                if !vm.running {
                    return HypervisorResponse::failure(
                        codes::INVALID_VM_MODE,
                        format!("VM {} is not running", capsule.vm_id),
                    );
                }
                vm.mode = target_mode;
                HypervisorResponse::success(format!(
                    "switched {} to {}",
                    capsule.vm_id, target_mode
                ))
            }
        })
    }

    async fn stop_vm(&self, capsule: &Capsule) -> Result<HypervisorResponse> {
        self.call(|state| match state.vms.get_mut(&capsule.vm_id) {
            None => vm_not_exist(&capsule.vm_id),
            Some(vm) => {
                vm.running = false;
                vm.mode = VmMode::NotDefined;
                HypervisorResponse::success(format!("stopped {}", capsule.vm_id))
            }
        })
    }

    async fn delete(&self, capsule: &Capsule) -> Result<HypervisorResponse> {
        self.call(|state| {
            if state.vms.remove(&capsule.vm_id).is_none() {
                vm_not_exist(&capsule.vm_id)
            } else {
                HypervisorResponse::success(format!("deleted {}", capsule.vm_id))
            }
        })
    }

    async fn update_pub_key(
        &self,
        capsule: &Capsule,
        pub_key: &str,
        _user_id: &str,
    ) -> Result<HypervisorResponse> {
        self.call(|state| match state.vms.get_mut(&capsule.vm_id) {
            None => vm_not_exist(&capsule.vm_id),
            Some(vm) => {
                vm.pub_keys.insert(pub_key.to_string());
                HypervisorResponse::success(format!("updated key on {}", capsule.vm_id))
            }
        })
    }

    async fn delete_pub_key(
        &self,
        capsule: &Capsule,
        pub_key: &str,
        _user_id: &str,
    ) -> Result<HypervisorResponse> {
        self.call(|state| match state.vms.get_mut(&capsule.vm_id) {
            None => vm_not_exist(&capsule.vm_id),
            Some(vm) => {
                vm.pub_keys.remove(pub_key);
                HypervisorResponse::success(format!("removed key from {}", capsule.vm_id))
            }
        })
    }

    async fn update_custos_creds(
        &self,
        capsule: &Capsule,
        _client_id: &str,
        _client_secret: &str,
    ) -> Result<HypervisorResponse> {
        self.call(|state| match state.vms.get(&capsule.vm_id) {
            None => vm_not_exist(&capsule.vm_id),
            Some(_) => HypervisorResponse::success(format!("updated creds on {}", capsule.vm_id)),
        })
    }

    async fn migrate_vm(
        &self,
        capsule: &Capsule,
        target: &VmPorts,
    ) -> Result<HypervisorResponse> {
        self.call(|state| match state.vms.get_mut(&capsule.vm_id) {
            None => vm_not_exist(&capsule.vm_id),
            Some(vm) => {
                vm.running = false;
                HypervisorResponse::success(format!(
                    "migrated {} to {}:{}",
                    capsule.vm_id, target.public_ip, target.ssh_port
                ))
            }
        })
    }
}
