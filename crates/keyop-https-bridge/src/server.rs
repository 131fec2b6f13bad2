use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use keyop_core::envelope::is_valid_channel_name;
use keyop_core::{Envelope, KeyopError};
use keyop_messenger::Messenger;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct HttpsBridgeServerConfig {
    pub bind: SocketAddr,
    pub cert_dir: PathBuf,
}

#[derive(Clone)]
struct AppState {
    messenger: Arc<Messenger>,
    local_route_stamp: String,
}

/// Runs the mTLS `POST /` server until `cancel` fires. Accepts only
/// `POST /`; the body is a single JSON-encoded [`Envelope`].
pub async fn run_server(
    cfg: HttpsBridgeServerConfig,
    messenger: Arc<Messenger>,
    local_route_stamp: String,
    cancel: CancellationToken,
) -> Result<(), KeyopError> {
    let tls_cfg = keyop_core::tls::server_config(&cfg.cert_dir)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_cfg));
    let listener = TcpListener::bind(cfg.bind)
        .await
        .map_err(KeyopError::StorageIo)?;
    info!(bind = %cfg.bind, "https bridge server listening");

    let state = AppState {
        messenger,
        local_route_stamp,
    };
    let app = Router::new()
        .route("/", post(handle_post))
        .with_state(state);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => { warn!(error = %e, "accept failed"); continue; }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(%peer, error = %e, "tls handshake failed");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls_stream);
                    let service = TowerToHyperService::new(app);
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        warn!(%peer, error = %e, "connection serve error");
                    }
                });
            }
            () = cancel.cancelled() => {
                info!("https bridge server shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_post(State(state): State<AppState>, body: String) -> StatusCode {
    let mut envelope: Envelope = match serde_json::from_str(&body) {
        Ok(e) => e,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    if !is_valid_channel_name(&envelope.channel_name) {
        return StatusCode::BAD_REQUEST;
    }
    envelope.append_route_stamp(state.local_route_stamp.clone());
    match state.messenger.send(envelope).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "failed to append received envelope");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use keyop_core::{RealClock, RealOs};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app(dir: &TempDir) -> Router {
        let messenger = Messenger::new(
            dir.path(),
            Arc::new(RealOs),
            Arc::new(RealClock),
            "https",
            "test",
        )
        .unwrap();
        let state = AppState {
            messenger: Arc::new(messenger),
            local_route_stamp: "thishost:https:test".to_string(),
        };
        Router::new().route("/", post(handle_post)).with_state(state)
    }

    #[tokio::test]
    async fn missing_channel_name_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let resp = app
            .oneshot(
                Request::post("/")
                    .body(Body::from(r#"{"Text":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn minimal_envelope_without_uuid_or_timestamp_is_accepted() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let resp = app
            .oneshot(
                Request::post("/")
                    .body(Body::from(r#"{"ChannelName":"c","Text":"hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let resp = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn valid_envelope_is_accepted_and_stamped() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let body = serde_json::to_string(&Envelope::new("events")).unwrap();
        let resp = app
            .oneshot(Request::post("/").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
