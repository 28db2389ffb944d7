//! HTTP provisioning API
//!
//! Three endpoints, all thin glue over the engine: list an account's peer
//! keys, register a peer, mint an account. Client-input failures return 422
//! with the reason string; system faults return 500 with a generic body and
//! the detail goes to the log only.

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;
use wgmint_common::{Error, RandomSource, Store};

use crate::accounts::Authorizer;
use crate::lifecycle::DeviceManager;
use crate::peers::Provisioner;

/// Shared state behind every handler.
pub struct AppState {
    pub store: Store,
    pub authorizer: Authorizer,
    pub provisioner: Provisioner,
    pub devices: Arc<DeviceManager>,
    pub rng: Arc<dyn RandomSource>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/pubkeys/:account", get(list_pubkeys_handler))
        .route("/wg/", post(new_peer_handler))
        .route("/new_account/", post(new_account_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: Error) -> Response {
    if err.is_client_error() {
        (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response()
    } else {
        error!("request failed: {}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}

async fn list_pubkeys_handler(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> Response {
    let account = match state.authorizer.validate_code(&account) {
        Ok(account) => account,
        Err(e) => return error_response(e),
    };
    match state.store.list_peers_for_account(account.id) {
        Ok(peers) => {
            let keys: Vec<String> = peers.into_iter().map(|p| p.public_key).collect();
            Json(keys).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct NewPeerForm {
    account: String,
    pubkey: String,
}

async fn new_peer_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<NewPeerForm>,
) -> Response {
    let account = match state.authorizer.validate_code(&form.account) {
        Ok(account) => account,
        Err(e) => return error_response(e),
    };
    let (device_id, _) = match state.devices.default_device() {
        Ok(device) => device,
        Err(e) => return error_response(e),
    };
    match state
        .provisioner
        .register(&account, device_id, &form.pubkey)
        .await
    {
        Ok(ips) => ips.to_string().into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct NewAccountForm {
    master_account: String,
    comment: String,
}

async fn new_account_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<NewAccountForm>,
) -> Response {
    match state
        .authorizer
        .create_account(state.rng.as_ref(), &form.master_account, &form.comment)
    {
        Ok(account) => account.code.into_response(),
        Err(e) => error_response(e),
    }
}
