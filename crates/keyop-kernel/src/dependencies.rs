use crate::config::ServiceConfig;
use keyop_core::{Clock, KeyopError, Os};
use keyop_messenger::Messenger;
use keyop_state::StateStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Everything a service needs injected rather than reaching for global
/// state — this is the one seam through which a service touches the
/// outside world, and the one seam tests replace with fakes.
#[derive(Clone)]
pub struct Dependencies {
    pub logger: Span,
    pub cancel: CancellationToken,
    pub os: Arc<dyn Os>,
    pub clock: Arc<dyn Clock>,
    pub messenger: Arc<Messenger>,
    pub state: Arc<StateStore>,
    pub config: ServiceConfig,
}

impl Dependencies {
    pub fn child_cancel(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

/// The three-phase lifecycle every service implements.
///
/// `validate_config` is pure and may be called before `initialize`;
/// the kernel aggregates errors across every configured service and
/// refuses to boot if any are present. `initialize` may spawn
/// long-lived tasks bound to `deps.cancel` and must return once it has
/// done so — it does not block for the service's lifetime. `check` is
/// the periodic tick; the kernel serializes invocations for the same
/// service and skips (never queues) a tick if the previous one is
/// still running.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn validate_config(&self, deps: &Dependencies) -> Vec<KeyopError>;

    async fn initialize(&self, deps: &Dependencies) -> Result<(), KeyopError>;

    async fn check(&self, deps: &Dependencies) -> Result<(), KeyopError>;

    /// How often the kernel ticks `check` for this service. Services
    /// that are purely push-driven (subscribe in `initialize`, no
    /// polling) may return a long interval and leave `check` a no-op.
    fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(60)
    }
}
