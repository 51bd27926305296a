//! Request authentication middleware

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{authorization::Basic, Authorization, HeaderMapExt};

use crate::auth::AuthenticatedUser;
use crate::error::ServerError;

use super::AppState;

/// Client address, honouring proxy headers before the socket peer.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    for header in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(header).and_then(|value| value.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    addr.ip().to_string()
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    headers
        .typed_get::<Authorization<Basic>>()
        .map(|auth| (auth.username().to_string(), auth.password().to_string()))
}

/// Verify HTTP Basic credentials against the user store.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    ip: &str,
    require_admin: bool,
    require_credentials: bool,
) -> Result<AuthenticatedUser, ServerError> {
    let (username, password) = basic_credentials(headers).ok_or(ServerError::Unauthorized)?;
    state
        .authorize
        .verify_user(&username, &password, ip, require_admin, require_credentials)
        .await
        .ok_or(ServerError::Unauthorized)
}

/// Require a valid user (password or token) and expose it to handlers.
pub async fn require_user(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(request.headers(), &addr);
    match authenticate(&state, request.headers(), &ip, false, false).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
