//! Local IPC bus (§6). One router, one `/rpc` entrypoint dispatching by
//! method name to the [`Dispatcher`], mirroring the shape of the bus
//! described in the external interfaces section: `RegisterProcess`,
//! `UnregisterProcess`, `CheckForUpdate`, `DownloadFirmware`,
//! `UpdateFirmware`. Unknown methods are rejected with a bus-level error;
//! unregistered callers are rejected by the dispatcher itself.

pub mod rpc;

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json},
    routing::post,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::error::UpdateError;
use crate::metrics::middleware::track_metrics;
use rpc::{RpcError, RpcRequest, RpcResponse};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl FromRef<AppState> for Arc<Dispatcher> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.dispatcher.clone()
    }
}

pub fn ipc_router(dispatcher: Arc<Dispatcher>) -> Router {
    let app_state = AppState { dispatcher };

    Router::new()
        .route("/rpc", post(rpc_handler))
        .layer(middleware::from_fn(track_metrics))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}

#[instrument(skip(state, request), fields(method = %request.method))]
async fn rpc_handler(State(state): State<Arc<Dispatcher>>, Json(request): Json<RpcRequest>) -> impl IntoResponse {
    let result = rpc::dispatch(&state, request).await;
    match result {
        Ok(value) => (StatusCode::OK, Json(RpcResponse::ok(value))).into_response(),
        Err(err) => {
            let status = status_for(&err);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                warn!(error = %err, "rpc call failed");
            }
            (status, Json(RpcResponse::err(err))).into_response()
        }
    }
}

fn status_for(err: &RpcError) -> StatusCode {
    match err {
        RpcError::UnknownMethod(_) => StatusCode::NOT_FOUND,
        RpcError::Update(UpdateError::Caller(_)) => StatusCode::UNAUTHORIZED,
        RpcError::Update(UpdateError::Validation(_)) | RpcError::Update(UpdateError::NotAvailable(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        RpcError::Update(UpdateError::InProgress) => StatusCode::CONFLICT,
        RpcError::Update(UpdateError::DownloadBlocked) => StatusCode::SERVICE_UNAVAILABLE,
        RpcError::Update(UpdateError::Config(_)) | RpcError::Update(UpdateError::Network(_)) | RpcError::Update(UpdateError::LocalSystem(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
