//! `keyopd`: hosts independently configured services around the local
//! file-backed publish/subscribe bus, bridged across hosts over mTLS
//! HTTPS and WebSocket connections.

mod config;
mod services;

use keyop_core::{RealClock, RealOs};
use keyop_kernel::{Dependencies, Kernel};
use keyop_messenger::Messenger;
use keyop_state::StateStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

fn init_tracing() {
    let default_level = if std::env::var("KEYOP_DEBUG").is_ok() {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn cert_dir_for(paths: &config::PathsConfig) -> PathBuf {
    match &paths.cert_dir {
        Some(dir) => dir.clone(),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keyop")
            .join("certs"),
    }
}

fn build_service(
    svc_config: &keyop_kernel::ServiceConfig,
    cert_dir: &PathBuf,
    state_dir: &PathBuf,
) -> Option<Arc<dyn keyop_kernel::Service>> {
    match svc_config.service_type.as_str() {
        "wss" => Some(Arc::new(services::WssService {
            name: svc_config.name.clone(),
            cert_dir: cert_dir.clone(),
        })),
        "wsc" => Some(Arc::new(services::WscService {
            name: svc_config.name.clone(),
            cert_dir: cert_dir.clone(),
            state_root: state_dir.clone(),
        })),
        "https_server" => Some(Arc::new(services::HttpsServerService {
            name: svc_config.name.clone(),
            cert_dir: cert_dir.clone(),
        })),
        "https_client" => Some(Arc::new(services::HttpsClientService {
            name: svc_config.name.clone(),
            cert_dir: cert_dir.clone(),
        })),
        other => {
            warn!(service = %svc_config.name, service_type = other, "unknown service type, skipping");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "keyopd starting");

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let os: Arc<dyn keyop_core::Os> = Arc::new(RealOs);
    let clock: Arc<dyn keyop_core::Clock> = Arc::new(RealClock);

    let hostname = cfg
        .hostname_override
        .clone()
        .unwrap_or_else(|| os.hostname().unwrap_or_else(|_| "localhost".to_string()));

    let cert_dir = cert_dir_for(&cfg.paths);
    let state_dir = cfg.paths.state_dir.clone();

    // One Messenger and one State Store for the whole process (spec.md
    // §2): `ChannelHandle`'s per-channel Notify and write-ordering gate
    // are instance-local, so two services sharing a channel only get
    // correct wake-ups and monotonic timestamps if they share this one
    // instance. "keyopd"/"core" stands in for "the current process"
    // in the route stamp this Messenger appends on every local Send;
    // bridges that relay a foreign envelope still pre-stamp with their
    // own specific host:type:name before calling Send.
    let messenger = match Messenger::new(
        cfg.paths.data_dir.clone(),
        os.clone(),
        clock.clone(),
        "keyopd",
        "core",
    ) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            eprintln!("FATAL: failed to open bus at {:?}: {e}", cfg.paths.data_dir);
            std::process::exit(1);
        }
    };
    let state = Arc::new(StateStore::new(state_dir.clone()));

    let mut kernel = Kernel::new();
    let root_cancel = kernel.root_cancel();

    for svc_config in &cfg.services {
        let Some(service) = build_service(svc_config, &cert_dir, &state_dir) else {
            continue;
        };

        let deps = Dependencies {
            logger: tracing::info_span!("service", name = %svc_config.name),
            cancel: root_cancel.child_token(),
            os: os.clone(),
            clock: clock.clone(),
            messenger: messenger.clone(),
            state: state.clone(),
            config: svc_config.clone(),
        };
        kernel.register(service, deps);
    }

    if let Err(errors) = kernel.validate_all() {
        for e in &errors {
            error!(error = %e, "service config invalid");
        }
        eprintln!("FATAL: {} service(s) failed validation", errors.len());
        std::process::exit(1);
    }

    if let Err(e) = kernel.initialize_all().await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }

    info!(hostname, services = cfg.services.len(), "keyopd initialized");

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        root_cancel.cancel();
    });

    kernel.run_until_cancelled().await;
    info!("keyopd exited");
}
