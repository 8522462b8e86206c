use tracing_subscriber::EnvFilter;

/// Crates whose logs are captured in full.
const CRATE_NAMES: &[&str] = &["kvload", "kvload_cli", "kvload_service", "kvload_test"];

/// Installs a global subscriber writing to the test harness output.
///
/// Everything from the load generator crates is captured down to `TRACE`, dependencies only log
/// errors. Calling this more than once is harmless, which allows every test to call it first.
///
/// # Example
///
/// ```
/// kvload_test::tracing::init();
/// ```
pub fn init() {
    let env_filter = CRATE_NAMES
        .iter()
        .fold(EnvFilter::new("ERROR"), |filter, name| {
            filter.add_directive(format!("{name}=TRACE").parse().unwrap())
        });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}
