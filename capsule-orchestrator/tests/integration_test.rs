//! Integration tests for the capsule lifecycle engine.
//!
//! Covers the quota-guarded persistence contract, state-machine atomicity,
//! and end-to-end command execution against the simulator backend.

use std::sync::Arc;
use std::time::Duration;

use capsule_hypervisor::simulator::CapsuleSimulator;
use capsule_hypervisor::{codes, Hypervisor};
use capsule_orchestrator::provision::{prepare_capsule, prepare_delete, prepare_migrate};
use capsule_orchestrator::test_utils::create_test_db;
use capsule_orchestrator::{
    AddShareesCommand, CapsuleError, CapsuleStore, CommandContext, CommandDispatcher,
    CreateCapsuleRequest, CreateVmCommand, DeletePublicKeyCommand, DeleteVmCommand,
    DispatcherConfig, ErrorKind, HypervisorCommand, MigrateVmCommand, Quota, RetriableTask,
    StartVmCommand, StateMachine, StopVmCommand, SwitchVmCommand, UpdatePublicKeyCommand, VmMode,
    VmPorts, VmState,
};

const STARTING_QUOTA: Quota = Quota {
    disk_gb: 100,
    cpu: 8,
    memory_mb: 16384,
};

struct Harness {
    store: CapsuleStore,
    state: StateMachine,
    sim: Arc<CapsuleSimulator>,
    ctx: CommandContext,
}

async fn harness() -> Harness {
    let pool = create_test_db().await;
    let store = CapsuleStore::new(pool.clone());
    let state = StateMachine::new(pool);
    let sim = Arc::new(CapsuleSimulator::new());

    let ctx = CommandContext::new(sim.clone(), store.clone(), state.clone()).with_db_retry(
        RetriableTask::new(Duration::from_millis(5), 3, [ErrorKind::Database]),
    );

    Harness {
        store,
        state,
        sim,
        ctx,
    }
}

fn fast_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        workers: 1,
        queue_depth: 16,
        retry_delay: Duration::from_millis(5),
        retry_attempts: 2,
    }
}

fn create_request(vm_id: &str, username: &str) -> CreateCapsuleRequest {
    CreateCapsuleRequest {
        vm_id: vm_id.to_string(),
        username: username.to_string(),
        image_name: "ubuntu-base".to_string(),
        vnc_username: "vncuser".to_string(),
        vnc_password: "vncpass".to_string(),
        host: VmPorts {
            public_ip: "10.0.0.5".to_string(),
            ssh_port: 2222,
            vnc_port: 5901,
        },
        working_dir: format!("/var/capsules/{}", vm_id),
        num_cpus: 2,
        memory_size_mb: 2048,
        disk_space_gb: 20,
    }
}

async fn bootstrap_user(store: &CapsuleStore, username: &str) {
    store
        .insert_user_if_absent(username, "user@example.org", &STARTING_QUOTA)
        .await
        .expect("Failed to bootstrap user");
}

/// Provision a capsule for `username`, create and boot its backend
/// resource, and land the record in Running.
async fn running_capsule(
    h: &Harness,
    vm_id: &str,
    username: &str,
) -> capsule_orchestrator::Capsule {
    let capsule = prepare_capsule(&h.store, &create_request(vm_id, username))
        .await
        .expect("Failed to prepare capsule");
    h.sim
        .create_vm(&capsule, "ssh-rsa AAAA", username)
        .await
        .expect("Failed to create backend VM");
    h.sim
        .launch_vm(&capsule)
        .await
        .expect("Failed to launch backend VM");
    h.state
        .transit_to(vm_id, VmState::CreatePending, VmState::Running, Some(username))
        .await
        .expect("Failed to transition to Running");
    h.store
        .get_capsule(username, vm_id)
        .await
        .expect("Failed to fetch capsule")
}

#[tokio::test]
async fn transit_with_stale_from_state_fails_and_leaves_state_unchanged() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .expect("Failed to prepare capsule");

    // The persisted state is CreatePending, not Running.
    let err = h
        .state
        .transit_to("c1", VmState::Running, VmState::Shutdown, Some("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidTransition { .. }));

    let (state, _) = h.state.current("c1").await.unwrap();
    assert_eq!(state, VmState::CreatePending);
}

#[tokio::test]
async fn transit_rejects_edges_outside_the_table() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();

    let err = h
        .state
        .transit_to("c1", VmState::CreatePending, VmState::Shutdown, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidTransition { .. }));

    let (state, _) = h.state.current("c1").await.unwrap();
    assert_eq!(state, VmState::CreatePending);
}

#[tokio::test]
async fn transit_on_missing_vm_reports_not_found() {
    let h = harness().await;

    let err = h
        .state
        .transit_to("no-such-vm", VmState::Running, VmState::Shutdown, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::NotFound(_)));
}

#[tokio::test]
async fn quota_reservation_is_all_or_nothing() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;

    // CPU dimension is unsatisfiable; disk and memory would fit.
    let err = h
        .store
        .reserve_quota(
            "alice",
            &Quota {
                disk_gb: 20,
                cpu: 9,
                memory_mb: 2048,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::QuotaExceeded(_)));

    // None of the three counters moved.
    assert_eq!(h.store.get_quota("alice").await.unwrap(), STARTING_QUOTA);
}

#[tokio::test]
async fn interleaved_reservations_and_deletions_preserve_the_quota_sum() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;

    let a = prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();
    let b = prepare_capsule(&h.store, &create_request("c2", "alice"))
        .await
        .unwrap();

    let after_two = h.store.get_quota("alice").await.unwrap();
    assert_eq!(
        after_two,
        Quota {
            disk_gb: 60,
            cpu: 4,
            memory_mb: 12288,
        }
    );

    // Release in the opposite order, with a third reservation in between.
    h.store.delete_capsule("alice", &b).await.unwrap();
    let c = prepare_capsule(&h.store, &create_request("c3", "alice"))
        .await
        .unwrap();
    h.store.delete_capsule("alice", &a).await.unwrap();
    h.store.delete_capsule("alice", &c).await.unwrap();

    assert_eq!(h.store.get_quota("alice").await.unwrap(), STARTING_QUOTA);
}

#[tokio::test]
async fn user_bootstrap_is_idempotent() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;

    h.store
        .reserve_quota(
            "alice",
            &Quota {
                disk_gb: 10,
                cpu: 1,
                memory_mb: 1024,
            },
        )
        .await
        .unwrap();

    // A second bootstrap must not reset the decremented counters.
    bootstrap_user(&h.store, "alice").await;
    assert_eq!(
        h.store.get_quota("alice").await.unwrap(),
        Quota {
            disk_gb: 90,
            cpu: 7,
            memory_mb: 15360,
        }
    );
}

#[tokio::test]
async fn create_then_delete_restores_quota_end_to_end() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;

    let capsule = prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();
    assert_eq!(capsule.state, VmState::CreatePending);
    assert_eq!(
        h.store.get_quota("alice").await.unwrap(),
        Quota {
            disk_gb: 80,
            cpu: 6,
            memory_mb: 14336,
        }
    );

    let dispatcher = CommandDispatcher::start(h.ctx.clone(), fast_dispatcher_config());
    dispatcher
        .add_command(Box::new(CreateVmCommand::new(capsule, "alice", "ssh-rsa AAAA")))
        .await
        .unwrap();
    dispatcher.shutdown().await;

    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();
    assert_eq!(capsule.state, VmState::Running);
    assert!(h.sim.vm_exists("c1"));

    let staged = prepare_delete(&h.state, &capsule, Some("alice")).await.unwrap();
    let dispatcher = CommandDispatcher::start(h.ctx.clone(), fast_dispatcher_config());
    dispatcher
        .add_command(Box::new(DeleteVmCommand::new(staged, "alice")))
        .await
        .unwrap();
    dispatcher.shutdown().await;

    let err = h.store.get_capsule("alice", "c1").await.unwrap_err();
    assert!(matches!(err, CapsuleError::NotFound(_)));
    assert!(!h.sim.vm_exists("c1"));
    assert_eq!(h.store.get_quota("alice").await.unwrap(), STARTING_QUOTA);
}

#[tokio::test]
async fn exhausted_retries_drive_the_capsule_to_error() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    let capsule = prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();

    // Every backend call fails at the transport level, so the create
    // command exhausts its retry budget.
    h.sim.inject_transport_faults(10);

    let dispatcher = CommandDispatcher::start(h.ctx.clone(), fast_dispatcher_config());
    dispatcher
        .add_command(Box::new(CreateVmCommand::new(capsule, "alice", "ssh-rsa AAAA")))
        .await
        .unwrap();
    dispatcher.shutdown().await;

    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();
    assert_eq!(capsule.state, VmState::Error);
    // Two attempts, no more: the cap was 2.
    assert_eq!(h.sim.call_count(), 2);
}

#[tokio::test]
async fn migrate_rejection_marks_error_without_touching_location() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    let capsule = prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();

    // Bring the capsule to Running with a real backend resource.
    h.sim.create_vm(&capsule, "ssh-rsa AAAA", "alice").await.unwrap();
    h.sim.launch_vm(&capsule).await.unwrap();
    h.state
        .transit_to("c1", VmState::CreatePending, VmState::Running, Some("alice"))
        .await
        .unwrap();
    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();

    let staged = prepare_migrate(&h.state, &capsule, Some("operator")).await.unwrap();
    h.sim
        .inject_rejection(codes::INVALID_INPUT_ARGS, "bad target host");

    let calls_before = h.sim.call_count();
    let dispatcher = CommandDispatcher::start(h.ctx.clone(), fast_dispatcher_config());
    dispatcher
        .add_command(Box::new(MigrateVmCommand::new(
            staged,
            "operator",
            VmPorts {
                public_ip: "10.0.0.99".to_string(),
                ssh_port: 2299,
                vnc_port: 5999,
            },
        )))
        .await
        .unwrap();
    dispatcher.shutdown().await;

    // A definitive rejection is not retried.
    assert_eq!(h.sim.call_count(), calls_before + 1);

    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();
    assert_eq!(capsule.state, VmState::Error);
    assert_eq!(
        capsule.ports(),
        VmPorts {
            public_ip: "10.0.0.5".to_string(),
            ssh_port: 2222,
            vnc_port: 5901,
        }
    );
}

#[tokio::test]
async fn delete_is_idempotent_and_never_double_restores_quota() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    let capsule = prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();

    h.sim.create_vm(&capsule, "ssh-rsa AAAA", "alice").await.unwrap();
    h.state
        .transit_to("c1", VmState::CreatePending, VmState::Running, Some("alice"))
        .await
        .unwrap();
    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();
    let staged = prepare_delete(&h.state, &capsule, Some("alice")).await.unwrap();

    let cmd = DeleteVmCommand::new(staged.clone(), "alice");
    cmd.execute(&h.ctx).await.expect("first delete failed");
    assert_eq!(h.store.get_quota("alice").await.unwrap(), STARTING_QUOTA);

    // The backend resource and the row are both gone; re-running the same
    // delete (e.g. after a crash between the two steps) must still succeed
    // and must not restore quota a second time.
    let cmd = DeleteVmCommand::new(staged, "alice");
    cmd.execute(&h.ctx).await.expect("second delete failed");
    assert_eq!(h.store.get_quota("alice").await.unwrap(), STARTING_QUOTA);
}

#[tokio::test]
async fn switch_persists_the_new_mode() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    let capsule = prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();

    h.sim.create_vm(&capsule, "ssh-rsa AAAA", "alice").await.unwrap();
    h.sim.launch_vm(&capsule).await.unwrap();
    h.state
        .transit_to("c1", VmState::CreatePending, VmState::Running, Some("alice"))
        .await
        .unwrap();
    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();

    let cmd = SwitchVmCommand::new(capsule, "alice", VmMode::Maintenance);
    cmd.execute(&h.ctx).await.unwrap();

    let (state, mode) = h.state.current("c1").await.unwrap();
    assert_eq!(state, VmState::Running);
    assert_eq!(mode, VmMode::Maintenance);
}

#[tokio::test]
async fn shutdown_drains_commands_already_enqueued() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;

    let mut capsules = Vec::new();
    for vm_id in ["c1", "c2", "c3"] {
        capsules.push(
            prepare_capsule(&h.store, &create_request(vm_id, "alice"))
                .await
                .unwrap(),
        );
    }

    let dispatcher = CommandDispatcher::start(h.ctx.clone(), fast_dispatcher_config());
    assert_eq!(dispatcher.backlog(), 0);
    for capsule in capsules {
        dispatcher
            .add_command(Box::new(CreateVmCommand::new(capsule, "alice", "ssh-rsa AAAA")))
            .await
            .unwrap();
    }
    dispatcher.shutdown().await;

    for vm_id in ["c1", "c2", "c3"] {
        let capsule = h.store.get_capsule("alice", vm_id).await.unwrap();
        assert_eq!(capsule.state, VmState::Running);
    }
}

#[tokio::test]
async fn stop_powers_down_and_resets_mode() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    let capsule = running_capsule(&h, "c1", "alice").await;

    // Put the capsule in a non-default mode first so the reset is
    // observable.
    SwitchVmCommand::new(capsule, "alice", VmMode::Secure)
        .execute(&h.ctx)
        .await
        .unwrap();
    let (_, mode) = h.state.current("c1").await.unwrap();
    assert_eq!(mode, VmMode::Secure);

    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();
    StopVmCommand::new(capsule, "alice").execute(&h.ctx).await.unwrap();

    let (state, mode) = h.state.current("c1").await.unwrap();
    assert_eq!(state, VmState::Shutdown);
    assert_eq!(mode, VmMode::NotDefined);
}

#[tokio::test]
async fn start_boots_a_stopped_capsule() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    let capsule = running_capsule(&h, "c1", "alice").await;

    StopVmCommand::new(capsule, "alice").execute(&h.ctx).await.unwrap();
    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();
    assert_eq!(capsule.state, VmState::Shutdown);

    StartVmCommand::new(capsule, "alice").execute(&h.ctx).await.unwrap();

    let (state, _) = h.state.current("c1").await.unwrap();
    assert_eq!(state, VmState::Running);
}

#[tokio::test]
async fn public_key_rotation_reaches_the_backend() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    let capsule = running_capsule(&h, "c1", "alice").await;

    UpdatePublicKeyCommand::new(capsule.clone(), "alice", "ssh-rsa ROTATED")
        .execute(&h.ctx)
        .await
        .unwrap();
    assert!(h.sim.vm_has_key("c1", "ssh-rsa ROTATED"));

    DeletePublicKeyCommand::new(capsule, "alice", "ssh-rsa ROTATED")
        .execute(&h.ctx)
        .await
        .unwrap();
    assert!(!h.sim.vm_has_key("c1", "ssh-rsa ROTATED"));
}

#[tokio::test]
async fn add_sharees_pushes_every_key() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    let capsule = running_capsule(&h, "c1", "alice").await;

    AddShareesCommand::new(
        capsule,
        "alice",
        vec!["ssh-rsa SHAREE-1".to_string(), "ssh-rsa SHAREE-2".to_string()],
    )
    .execute(&h.ctx)
    .await
    .unwrap();

    assert!(h.sim.vm_has_key("c1", "ssh-rsa SHAREE-1"));
    assert!(h.sim.vm_has_key("c1", "ssh-rsa SHAREE-2"));
}

#[tokio::test]
async fn full_access_flag_round_trips() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();

    h.store.update_full_access("c1", Some(true)).await.unwrap();
    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();
    assert_eq!(capsule.full_access, Some(true));

    h.store.update_full_access("c1", None).await.unwrap();
    let capsule = h.store.get_capsule("alice", "c1").await.unwrap();
    assert_eq!(capsule.full_access, None);

    let err = h.store.update_full_access("ghost", Some(true)).await.unwrap_err();
    assert!(matches!(err, CapsuleError::NotFound(_)));
}

#[tokio::test]
async fn list_all_returns_live_capsules_across_users() {
    let h = harness().await;
    bootstrap_user(&h.store, "alice").await;
    bootstrap_user(&h.store, "bob").await;

    prepare_capsule(&h.store, &create_request("c1", "alice"))
        .await
        .unwrap();
    let b = prepare_capsule(&h.store, &create_request("c2", "bob"))
        .await
        .unwrap();

    let all = h.store.list_all_capsules().await.unwrap();
    assert_eq!(all.len(), 2);

    h.store.delete_capsule("bob", &b).await.unwrap();

    let all = h.store.list_all_capsules().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].vm_id, "c1");
    assert_eq!(all[0].owner, "alice");
}
