use crate::dependencies::{Dependencies, Service};
use keyop_core::KeyopError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Registered {
    service: Arc<dyn Service>,
    deps: Dependencies,
}

/// Owns the root cancellable context and drives every configured
/// service through validate → initialize → periodic check.
pub struct Kernel {
    root_cancel: CancellationToken,
    services: Vec<Registered>,
}

impl Kernel {
    pub fn new() -> Self {
        Kernel {
            root_cancel: CancellationToken::new(),
            services: Vec::new(),
        }
    }

    pub fn register(&mut self, service: Arc<dyn Service>, deps: Dependencies) {
        self.services.push(Registered { service, deps });
    }

    /// Validates every service, aborting with the aggregate error list
    /// if any service's config is invalid.
    pub fn validate_all(&self) -> Result<(), Vec<KeyopError>> {
        let mut errors = Vec::new();
        for reg in &self.services {
            errors.extend(reg.service.validate_config(&reg.deps));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Initializes every service in registration order. A failure is
    /// fatal to kernel startup.
    pub async fn initialize_all(&self) -> Result<(), KeyopError> {
        for reg in &self.services {
            info!(service = reg.service.name(), "initializing service");
            reg.service.initialize(&reg.deps).await.map_err(|e| {
                KeyopError::Fatal(format!("{} failed to initialize: {e}", reg.service.name()))
            })?;
        }
        Ok(())
    }

    /// Spawns the periodic `check` scheduler for every service and
    /// blocks until the root context is cancelled (e.g. SIGINT/SIGTERM).
    pub async fn run_until_cancelled(self) {
        let mut tasks = JoinSet::new();
        for reg in self.services {
            let cancel = self.root_cancel.clone();
            tasks.spawn(run_check_loop(reg, cancel));
        }
        self.root_cancel.cancelled().await;
        info!("kernel shutting down, draining service check loops");
        while tasks.join_next().await.is_some() {}
    }

    pub fn shutdown(&self) {
        self.root_cancel.cancel();
    }

    pub fn root_cancel(&self) -> CancellationToken {
        self.root_cancel.clone()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_check_loop(reg: Registered, cancel: CancellationToken) {
    let interval = reg.service.check_interval();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let running = Arc::new(AtomicBool::new(false));

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    warn!(service = reg.service.name(), "check still running, skipping tick");
                    continue;
                }
                let service = reg.service.clone();
                let deps = reg.deps.clone();
                let running = running.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.check(&deps).await {
                        error!(service = service.name(), error = %e, "check failed");
                    }
                    running.store(false, Ordering::SeqCst);
                });
            }
        }
    }
}
