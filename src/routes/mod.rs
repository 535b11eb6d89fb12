//! HTTP management API.
//!
//! | Method | Path    | Description                                 |
//! |--------|---------|---------------------------------------------|
//! | POST   | `/`     | Create a tunnel back to the caller's address |
//! | GET    | `/`     | List tunnels                                |
//! | GET    | `/{id}` | Show one tunnel                             |
//! | PUT    | `/{id}` | Point a tunnel at the caller's address      |
//! | DELETE | `/{id}` | Drain and remove a tunnel                   |
//!
//! Every route requires the `X-IP6TUN-AUTH` header (see [`crate::auth`]).
//! Handlers read the caller's address from `ConnectInfo<SocketAddr>`, so the
//! router must be served with `into_make_service_with_connect_info`.

pub mod tunnels;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::get,
    Extension, Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::state::AppState;

/// Request bodies are tiny JSON objects; anything bigger is rejected.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the management router.
pub fn router(state: AppState) -> Router {
    let api_key = ApiKey(state.config.auth.api_key.clone());
    let max_requests = state.config.server.max_concurrent_requests.max(1);

    Router::new()
        .route("/", get(tunnels::list).post(tunnels::create))
        .route(
            "/{id}",
            get(tunnels::view)
                .put(tunnels::update)
                .delete(tunnels::delete),
        )
        .layer(middleware::from_fn(auth::require_api_key))
        .layer(Extension(api_key))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(GlobalConcurrencyLimitLayer::new(max_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
