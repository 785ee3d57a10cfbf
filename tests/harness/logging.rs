/// Installs a fmt subscriber when built with `--features test-logging`.
///
/// Filter with `RUST_LOG`, e.g. `RUST_LOG=layerio=trace`.
#[cfg(feature = "test-logging")]
pub fn init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(not(feature = "test-logging"))]
pub fn init() {}
