use crate::account::Account;
use crate::error::ApiError;
use crate::server::AppState;
use crate::store::Session;
use axum::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use log::{debug, warn};
use std::sync::Arc;

pub const SESSION_COOKIE: &str = "session_key";

/// Random 128-bit session key, lowercase hex
pub fn gen_session_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// `Set-Cookie` value carrying a session key
pub fn session_cookie(key: &str) -> String {
    format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, key)
}

/// Value of a cookie from the request headers
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

fn response_sets_session(headers: &HeaderMap) -> bool {
    let prefix = format!("{}=", SESSION_COOKIE);
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.starts_with(&prefix))
}

/// Session of the current request, put in the request extensions by
/// [`session_middleware`]
#[derive(Debug, Clone)]
pub struct RequestSession {
    pub key: Option<String>,
    pub session: Session,
}

/// Load the session named by the `session_key` cookie before the handler runs
/// and hand out a fresh key to clients that have none.
pub async fn session_middleware(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let key = cookie_value(req.headers(), SESSION_COOKIE);
    let session = match &key {
        Some(key) => state.store.get_user_session(key).await,
        None => Session::new(),
    };
    req.extensions_mut().insert(RequestSession {
        key: key.clone(),
        session,
    });

    let mut response = next.run(req).await;

    if key.is_none() && !response_sets_session(response.headers()) {
        let cookie = session_cookie(&gen_session_key());
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => warn!("[HTTP] Could not build session cookie: {}", e),
        }
    }
    response
}

/// Account of the logged in caller. Rejects with 403 when the session is
/// empty or names an account that no longer exists.
#[derive(Debug, Clone)]
pub struct AuthenticatedAccount {
    pub account: Account,
    pub session_key: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedAccount {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let no_auth = || ApiError::forbidden("This route needs authentication");

        let request_session = parts.extensions.get::<RequestSession>().ok_or_else(no_auth)?;
        let key = request_session.key.clone().ok_or_else(no_auth)?;
        let name = request_session.session.account.as_deref().ok_or_else(no_auth)?;

        match state.accounts.get(name) {
            Some(account) => Ok(AuthenticatedAccount {
                account,
                session_key: key,
            }),
            None => {
                debug!("[HTTP] Session names unknown account '{}'", name);
                Err(no_auth())
            }
        }
    }
}
