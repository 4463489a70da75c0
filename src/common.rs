//! Test fixtures shared across modules.

pub(crate) type LogConfig = tracing_subscriber::fmt::SubscriberBuilder<
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Full, ()>,
    tracing_subscriber::EnvFilter,
>;

#[rstest::fixture]
pub(crate) fn log_conf() -> LogConfig {
    let env = tracing_subscriber::EnvFilter::from_default_env();
    tracing_subscriber::fmt::Subscriber::builder().with_env_filter(env).without_time()
}

#[rstest::fixture]
pub(crate) fn log_stdout(log_conf: LogConfig) {
    let _ = log_conf.with_test_writer().try_init();
}

static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

/// A queue name no other test (or test run) uses. The queue is unlinked when this is dropped, so
/// failed tests do not leak queues into the system namespace.
pub(crate) struct TempName(String);

impl TempName {
    pub(crate) fn new(prefix: &str) -> Self {
        let count = COUNTER.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        Self(format!("/{prefix}-{}-{count}", std::process::id()))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for TempName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for TempName {
    fn drop(&mut self) {
        // Most tests never unlink on their own
        let _ = crate::unlink(&self.0);
    }
}

#[rstest::fixture]
pub(crate) fn queue_name(#[default("mqueue-test")] prefix: &str) -> TempName {
    TempName::new(prefix)
}
