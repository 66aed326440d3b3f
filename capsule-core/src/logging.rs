use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Honors `RUST_LOG` when set; otherwise defaults to info-level output for
/// the capsule crates. Call once at process start.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("capsule_core=info,capsule_hypervisor=info,capsule_orchestrator=info")
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
