//! Concrete [`Service`] implementations wiring each configured service
//! `type` to the bridge crate that implements it. `keyopd` itself knows
//! nothing about WebSockets or HTTPS beyond this mapping — the bridges
//! are self-contained libraries.

use keyop_core::{Envelope, KeyopError};
use keyop_kernel::{Dependencies, Service};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, warn};

fn channel_names(roles: &std::collections::HashMap<String, keyop_kernel::ChannelInfo>) -> Vec<String> {
    roles.values().map(|c| c.name.clone()).collect()
}

fn local_host(deps: &Dependencies) -> Result<String, KeyopError> {
    Ok(keyop_core::envelope::short_hostname(&deps.os.hostname()?))
}

/// A WebSocket bridge server: pushes channels the host publishes out to
/// connecting `wsc` clients.
pub struct WssService {
    pub name: String,
    pub cert_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct WssConfigBody {
    bind: SocketAddr,
}

#[async_trait::async_trait]
impl Service for WssService {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_config(&self, deps: &Dependencies) -> Vec<KeyopError> {
        match serde_json::from_value::<WssConfigBody>(deps.config.config.clone()) {
            Ok(_) => vec![],
            Err(e) => vec![KeyopError::InvalidArgument(format!(
                "{}: invalid wss config: {e}",
                self.name
            ))],
        }
    }

    async fn initialize(&self, deps: &Dependencies) -> Result<(), KeyopError> {
        let body: WssConfigBody = serde_json::from_value(deps.config.config.clone())
            .map_err(|e| KeyopError::Fatal(format!("{}: {e}", self.name)))?;
        let served_channels = deps
            .config
            .subs
            .values()
            .map(|c| (c.name.clone(), c.max_age()))
            .collect();

        let cfg = keyop_ws_bridge::WsBridgeServerConfig {
            bind: body.bind,
            cert_dir: self.cert_dir.clone(),
            served_channels,
        };
        let messenger = deps.messenger.clone();
        let cancel = deps.child_cancel();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = keyop_ws_bridge::run_server(cfg, messenger, cancel).await {
                error!(service = %name, error = %e, "ws bridge server exited with error");
            }
        });
        Ok(())
    }

    async fn check(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
        Ok(())
    }

    fn check_interval(&self) -> Duration {
        Duration::from_secs(300)
    }
}

/// A WebSocket bridge client: pulls the channels it subscribes to from
/// a remote `wss` server, resuming by cursor across reconnects.
pub struct WscService {
    pub name: String,
    pub cert_dir: PathBuf,
    pub state_root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct WscConfigBody {
    server_url: String,
}

#[async_trait::async_trait]
impl Service for WscService {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_config(&self, deps: &Dependencies) -> Vec<KeyopError> {
        match serde_json::from_value::<WscConfigBody>(deps.config.config.clone()) {
            Ok(_) => vec![],
            Err(e) => vec![KeyopError::InvalidArgument(format!(
                "{}: invalid wsc config: {e}",
                self.name
            ))],
        }
    }

    async fn initialize(&self, deps: &Dependencies) -> Result<(), KeyopError> {
        let body: WscConfigBody = serde_json::from_value(deps.config.config.clone())
            .map_err(|e| KeyopError::Fatal(format!("{}: {e}", self.name)))?;
        let channels = channel_names(&deps.config.subs);
        let host = local_host(deps)?;

        let cfg = keyop_ws_bridge::WsBridgeClientConfig {
            server_url: body.server_url,
            cert_dir: self.cert_dir.clone(),
            channels,
            route_loop_skip_host: Some(host),
        };
        let cursor_store = keyop_state::StateStore::new(self.state_root.join(&self.name));
        let messenger = deps.messenger.clone();
        let cancel = deps.child_cancel();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) =
                keyop_ws_bridge::run_client(cfg, messenger, cursor_store, cancel).await
            {
                error!(service = %name, error = %e, "ws bridge client exited with error");
            }
        });
        Ok(())
    }

    async fn check(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
        Ok(())
    }

    fn check_interval(&self) -> Duration {
        Duration::from_secs(300)
    }
}

/// An HTTPS POST bridge server: accepts single-envelope pushes from
/// constrained publishers over mTLS.
pub struct HttpsServerService {
    pub name: String,
    pub cert_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct HttpsServerConfigBody {
    bind: SocketAddr,
}

#[async_trait::async_trait]
impl Service for HttpsServerService {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_config(&self, deps: &Dependencies) -> Vec<KeyopError> {
        match serde_json::from_value::<HttpsServerConfigBody>(deps.config.config.clone()) {
            Ok(_) => vec![],
            Err(e) => vec![KeyopError::InvalidArgument(format!(
                "{}: invalid https_server config: {e}",
                self.name
            ))],
        }
    }

    async fn initialize(&self, deps: &Dependencies) -> Result<(), KeyopError> {
        let body: HttpsServerConfigBody = serde_json::from_value(deps.config.config.clone())
            .map_err(|e| KeyopError::Fatal(format!("{}: {e}", self.name)))?;
        let host = local_host(deps)?;
        let route_stamp = Envelope::route_stamp(&host, "https_server", &self.name);

        let cfg = keyop_https_bridge::HttpsBridgeServerConfig {
            bind: body.bind,
            cert_dir: self.cert_dir.clone(),
        };
        let messenger = deps.messenger.clone();
        let cancel = deps.child_cancel();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = keyop_https_bridge::run_server(cfg, messenger, route_stamp, cancel).await {
                error!(service = %name, error = %e, "https bridge server exited with error");
            }
        });
        Ok(())
    }

    async fn check(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
        Ok(())
    }

    fn check_interval(&self) -> Duration {
        Duration::from_secs(300)
    }
}

/// An HTTPS POST bridge client: subscribes to one local channel and
/// POSTs every envelope to a remote `https_server`.
pub struct HttpsClientService {
    pub name: String,
    pub cert_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct HttpsClientConfigBody {
    target_url: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[async_trait::async_trait]
impl Service for HttpsClientService {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_config(&self, deps: &Dependencies) -> Vec<KeyopError> {
        let mut errors = Vec::new();
        match serde_json::from_value::<HttpsClientConfigBody>(deps.config.config.clone()) {
            Ok(_) => {}
            Err(e) => errors.push(KeyopError::InvalidArgument(format!(
                "{}: invalid https_client config: {e}",
                self.name
            ))),
        }
        if deps.config.pubs.is_empty() {
            errors.push(KeyopError::InvalidArgument(format!(
                "{}: https_client requires exactly one [pubs] entry naming the local channel to forward",
                self.name
            )));
        }
        errors
    }

    async fn initialize(&self, deps: &Dependencies) -> Result<(), KeyopError> {
        let body: HttpsClientConfigBody = serde_json::from_value(deps.config.config.clone())
            .map_err(|e| KeyopError::Fatal(format!("{}: {e}", self.name)))?;
        let pub_channel = deps.config.pubs.values().next().ok_or_else(|| {
            KeyopError::Fatal(format!(
                "{}: https_client requires a [pubs] entry",
                self.name
            ))
        })?;
        let source_channel = pub_channel.name.clone();
        let max_age = pub_channel.max_age();
        let host = local_host(deps)?;

        let cfg = keyop_https_bridge::HttpsBridgeClientConfig {
            target_url: body.target_url,
            cert_dir: self.cert_dir.clone(),
            timeout: Duration::from_secs(body.timeout_secs.unwrap_or(10)),
            route_loop_skip_host: Some(host),
        };
        let messenger = deps.messenger.clone();
        let name = self.name.clone();
        let reader_name = format!("{name}_https_out");
        let cancel = deps.child_cancel();
        match keyop_https_bridge::run_client(cfg, messenger, reader_name, source_channel, max_age)
            .await
        {
            Ok(sub) => {
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    sub.cancel();
                });
                Ok(())
            }
            Err(e) => {
                warn!(service = %name, error = %e, "https bridge client failed to subscribe");
                Err(e)
            }
        }
    }

    async fn check(&self, _deps: &Dependencies) -> Result<(), KeyopError> {
        Ok(())
    }

    fn check_interval(&self) -> Duration {
        Duration::from_secs(300)
    }
}
