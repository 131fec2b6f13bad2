use keyop_core::{Envelope, KeyopError};
use keyop_messenger::Messenger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpsBridgeClientConfig {
    pub target_url: String,
    pub cert_dir: PathBuf,
    pub timeout: Duration,
    /// Hint host: if an envelope's route already contains this host,
    /// it is dropped rather than forwarded (loop suppression).
    pub route_loop_skip_host: Option<String>,
}

impl Default for HttpsBridgeClientConfig {
    fn default() -> Self {
        HttpsBridgeClientConfig {
            target_url: String::new(),
            cert_dir: PathBuf::new(),
            timeout: Duration::from_secs(10),
            route_loop_skip_host: None,
        }
    }
}

fn build_client(cfg: &HttpsBridgeClientConfig) -> Result<reqwest::Client, KeyopError> {
    let tls_cfg = keyop_core::tls::client_config(&cfg.cert_dir)?;
    reqwest::Client::builder()
        .use_preconfigured_tls(tls_cfg)
        .timeout(cfg.timeout)
        .build()
        .map_err(|e| KeyopError::Fatal(format!("building https bridge client: {e}")))
}

/// Subscribes to `source_channel` and POSTs every envelope to
/// `cfg.target_url`. A publish failure returns an error so the
/// Messenger redelivers the same line after backoff.
pub async fn run_client(
    cfg: HttpsBridgeClientConfig,
    messenger: Arc<Messenger>,
    reader_name: impl Into<String>,
    source_channel: impl Into<String>,
    max_age: Option<chrono::Duration>,
) -> Result<keyop_messenger::Subscription, KeyopError> {
    let client = build_client(&cfg)?;
    let url = cfg.target_url.clone();
    let skip_host = cfg.route_loop_skip_host.clone();

    messenger
        .subscribe(reader_name, source_channel, max_age, move |envelope| {
            let client = client.clone();
            let url = url.clone();
            let skip_host = skip_host.clone();
            Box::pin(async move { post_one(&client, &url, skip_host.as_deref(), envelope).await })
        })
        .await
}

async fn post_one(
    client: &reqwest::Client,
    url: &str,
    skip_host: Option<&str>,
    envelope: Envelope,
) -> Result<(), KeyopError> {
    if let Some(host) = skip_host {
        if envelope.route_contains_host(host) {
            debug!(uuid = %envelope.uuid, host, "loop guard: dropping envelope without posting");
            return Ok(());
        }
    }
    let resp = client
        .post(url)
        .json(&envelope)
        .send()
        .await
        .map_err(|e| KeyopError::Transient(e.to_string()))?;
    if resp.status().is_success() {
        Ok(())
    } else {
        warn!(status = %resp.status(), "https bridge post rejected");
        Err(KeyopError::Transient(format!(
            "server responded {}",
            resp.status()
        )))
    }
}
