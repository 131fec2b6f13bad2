pub mod config;
pub mod dependencies;
pub mod scheduler;

pub use config::{ChannelInfo, ServiceConfig};
pub use dependencies::{Dependencies, Service};
pub use scheduler::Kernel;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use keyop_core::KeyopError;
    use keyop_messenger::Messenger;
    use keyop_state::StateStore;
    use keyop_test_utils::{FakeClock, FakeOs};
    use std::sync::Arc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use tracing::Span;

    // Messenger state lives entirely behind `Os`, so it runs hermetically
    // against `FakeOs` with no real disk I/O. `StateStore` talks to
    // `tokio::fs` directly and still needs a real directory.
    fn test_deps(dir: &TempDir, config: ServiceConfig) -> Dependencies {
        let os: Arc<dyn keyop_core::Os> = Arc::new(FakeOs::new("test-host"));
        let clock: Arc<dyn keyop_core::Clock> =
            Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap()));
        let messenger = Messenger::new(
            PathBuf::from("/bus"),
            os.clone(),
            clock.clone(),
            "svc",
            "test",
        )
        .unwrap();
        Dependencies {
            logger: Span::current(),
            cancel: CancellationToken::new(),
            os,
            clock,
            messenger: Arc::new(messenger),
            state: Arc::new(StateStore::new(dir.path().join("state"))),
            config,
        }
    }

    fn blank_config(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            service_type: "noop".to_string(),
            config: serde_json::Value::Null,
            pubs: Default::default(),
            subs: Default::default(),
        }
    }

    struct FailingValidate;

    #[async_trait::async_trait]
    impl Service for FailingValidate {
        fn name(&self) -> &str {
            "failing_validate"
        }
        fn validate_config(&self, _deps: &Dependencies) -> Vec<KeyopError> {
            vec![KeyopError::InvalidArgument("missing field".into())]
        }
        async fn initialize(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
            Ok(())
        }
        async fn check(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
            Ok(())
        }
    }

    #[test]
    fn validate_all_aggregates_errors_across_services() {
        let dir = TempDir::new().unwrap();
        let mut kernel = Kernel::new();
        kernel.register(Arc::new(FailingValidate), test_deps(&dir, blank_config("a")));
        kernel.register(Arc::new(FailingValidate), test_deps(&dir, blank_config("b")));
        let errors = kernel.validate_all().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    struct FailingInit;

    #[async_trait::async_trait]
    impl Service for FailingInit {
        fn name(&self) -> &str {
            "failing_init"
        }
        fn validate_config(&self, _deps: &Dependencies) -> Vec<KeyopError> {
            vec![]
        }
        async fn initialize(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
            Err(KeyopError::Fatal("boom".into()))
        }
        async fn check(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn initialize_all_is_fatal_on_error() {
        let dir = TempDir::new().unwrap();
        let mut kernel = Kernel::new();
        kernel.register(Arc::new(FailingInit), test_deps(&dir, blank_config("a")));
        let err = kernel.initialize_all().await.unwrap_err();
        assert!(matches!(err, KeyopError::Fatal(_)));
    }

    struct SlowCheck {
        calls: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Service for SlowCheck {
        fn name(&self) -> &str {
            "slow_check"
        }
        fn validate_config(&self, _deps: &Dependencies) -> Vec<KeyopError> {
            vec![]
        }
        async fn initialize(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
            Ok(())
        }
        async fn check(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
        fn check_interval(&self) -> Duration {
            Duration::from_millis(30)
        }
    }

    #[tokio::test]
    async fn overlapping_ticks_are_skipped_not_queued() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let mut kernel = Kernel::new();
        let root = kernel.root_cancel();
        kernel.register(
            Arc::new(SlowCheck {
                calls: calls.clone(),
            }),
            test_deps(&dir, blank_config("a")),
        );

        let handle = tokio::spawn(kernel.run_until_cancelled());
        tokio::time::sleep(Duration::from_millis(250)).await;
        root.cancel();
        handle.await.unwrap();

        // a 200ms check on a 30ms tick can run at most twice in 250ms
        // if overlapping ticks are correctly skipped rather than queued
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }
}
