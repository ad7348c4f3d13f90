//! Tracing initialisation helpers for tests.
//!
//! Call [`init_test_tracing`] at the top of any test that wants bridge and
//! handler events captured by the test harness. Tests using `test_log::test`
//! get the same behaviour from the attribute instead.
//!
//! The subscriber is initialised at most once per process, so it is safe to
//! call from every test function.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_TEST_FILTER: &str = "warn,allocfs_core=debug";

/// Initialise a subscriber that writes to the test-harness writer and
/// respects `RUST_LOG`, falling back to [`DEFAULT_TEST_FILTER`].
///
/// # Example
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     allocfs_test_utils::tracing_setup::init_test_tracing();
///     tracing::debug!("visible with the default filter");
/// }
/// ```
pub fn init_test_tracing() {
    init_test_tracing_with(DEFAULT_TEST_FILTER);
}

/// Like [`init_test_tracing`] with an explicit fallback filter.
pub fn init_test_tracing_with(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_test_writer()
        .try_init();
}
