//! HTTP control plane served on the daemon socket.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kr_core::pairing::PairingOptions;
use kr_core::protocol::{MeRequest, MeResponse, RequestBody};
use kr_core::{EnclaveClient, EnclaveError, Request, ResponseBody};

pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub client: EnclaveClient,
}

/// Broker failures rendered as HTTP status codes.
pub struct ApiError(pub EnclaveError);

impl From<EnclaveError> for ApiError {
    fn from(e: EnclaveError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EnclaveError::NotPaired => StatusCode::NOT_FOUND,
            EnclaveError::Rejected(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/pair", put(put_pair).get(get_pair).delete(delete_pair))
        .route("/enclave", put(put_enclave))
        .route("/ping", get(ping))
        .route("/version", get(version))
        .with_state(state)
}

// PUT /pair
async fn put_pair(State(state): State<AppState>, body: Bytes) -> Response {
    let options: PairingOptions = if body.is_empty() {
        PairingOptions::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(o) => o,
            Err(e) => return (StatusCode::BAD_REQUEST, format!("bad pairing options: {}", e)).into_response(),
        }
    };
    match state.client.pair(options).await {
        Ok(qr) => {
            info!(workstation = %qr.workstation_name, "new pairing created");
            Json(qr).into_response()
        }
        Err(e) => {
            error!(error = %e, "pairing failed");
            ApiError(e).into_response()
        }
    }
}

// GET /pair
async fn get_pair(State(state): State<AppState>, body: Bytes) -> Response {
    let me_request: MeRequest = if body.is_empty() {
        MeRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(m) => m,
            Err(e) => return (StatusCode::BAD_REQUEST, format!("bad me request: {}", e)).into_response(),
        }
    };
    match state.client.await_pairing_me(me_request).await {
        Ok(me) => Json(me).into_response(),
        Err(EnclaveError::Internal(msg)) => {
            error!(error = %msg, "pairing identity fetch failed");
            (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
        }
        Err(e) => {
            debug!(error = %e, "pairing did not complete");
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
    }
}

// DELETE /pair
async fn delete_pair(State(state): State<AppState>) -> StatusCode {
    state.client.unpair();
    StatusCode::OK
}

// PUT /enclave
async fn put_enclave(State(state): State<AppState>, body: Bytes) -> Response {
    let mut request: Request = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad request: {}", e)).into_response(),
    };
    if request.request_id.is_empty() {
        match Request::new(RequestBody::NoOp) {
            Ok(fresh) => request.request_id = fresh.request_id,
            Err(e) => return ApiError(e.into()).into_response(),
        }
    }

    let me_user_id = match &request.body {
        RequestBody::Me(me) => Some(me.pgp_user_id.clone()),
        _ => None,
    };
    let result = match me_user_id {
        Some(Some(uid)) => state.client.request_me_force_refresh(Some(uid)).await,
        Some(None) => state.client.request_me().await,
        None => {
            return match state.client.request_generic(request).await {
                Ok(response) => enclave_reply(response),
                Err(e) => ApiError(e).into_response(),
            }
        }
    };
    match result {
        Ok(me) => enclave_reply(kr_core::Response::new(
            request.request_id,
            Some(ResponseBody::Me(MeResponse { me })),
        )),
        Err(e) => ApiError(e).into_response(),
    }
}

fn enclave_reply(response: kr_core::Response) -> Response {
    if let Some(e) = response.error() {
        warn!(error = e, "phone returned an error");
        return (StatusCode::BAD_REQUEST, Json(response)).into_response();
    }
    Json(response).into_response()
}

// GET /ping
async fn ping() -> StatusCode {
    StatusCode::OK
}

// GET /version
async fn version() -> &'static str {
    DAEMON_VERSION
}

/// Serve the control plane over HTTP/1 on a Unix socket.
pub async fn serve(listener: UnixListener, router: Router, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accept = listener.accept() => match accept {
                Ok((stream, _)) => {
                    let service = TowerToHyperService::new(router.clone());
                    tokio::spawn(async move {
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(error = %e, "control connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "control accept failed"),
            },
            _ = shutdown.changed() => {
                info!("control plane stopping");
                return;
            }
        }
    }
}
