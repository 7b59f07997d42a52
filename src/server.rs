use crate::account::AccountManager;
use crate::routes;
use crate::session::session_middleware;
use crate::smtp::MailSender;
use crate::store::MailStore;
use anyhow::Result;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

/// Shared state of the HTTP handlers
pub struct AppState {
    pub store: Arc<MailStore>,
    pub accounts: AccountManager,
    pub sender: MailSender,
}

impl AppState {
    pub fn new(store: Arc<MailStore>, accounts: AccountManager, sender: MailSender) -> Self {
        Self {
            store,
            accounts,
            sender,
        }
    }
}

/// Optional parts of the HTTP surface
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Directory with the web client, served for every unknown path
    pub static_dir: Option<PathBuf>,
    /// Origin allowed to call the API with credentials from another site
    pub allow_origin: Option<String>,
}

/// Build the router with every route of the webmail API
pub fn build_router(state: Arc<AppState>, options: &HttpOptions) -> Result<Router> {
    let api = Router::new()
        .route("/login", post(routes::login))
        .route("/logout", get(routes::logout))
        .route("/api/account", get(routes::account))
        .route("/api/mailboxes", get(routes::mailboxes))
        .route("/api/mailbox/:mailbox_id", get(routes::mailbox))
        .route("/api/mail/:mail_id", get(routes::mail))
        .route("/api/mail/:mail_id/mark_read", post(routes::mail_mark_read))
        .route(
            "/api/mail/:mail_id/attachment/:att_index/:filename",
            get(routes::mail_download_attachment),
        )
        .route("/api/sendmail/", post(routes::sendmail))
        .route("/api/mail/:mail_id/resend", post(routes::mail_resend))
        .route("/api/contacts/search", get(routes::contacts_search))
        .route("/", get(routes::index))
        .route("/health", get(routes::health_check));

    let mut app = match &options.static_dir {
        Some(dir) => {
            info!("[HTTP] Serving static files from {:?}", dir);
            api.fallback_service(ServeDir::new(dir))
        }
        None => api,
    };

    app = app.layer(middleware::from_fn_with_state(state.clone(), session_middleware));

    if let Some(origin) = &options.allow_origin {
        let cors = CorsLayer::new()
            .allow_origin(HeaderValue::from_str(origin)?)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE])
            .allow_credentials(true);
        app = app.layer(ServiceBuilder::new().layer(cors));
    }

    Ok(app.with_state(state))
}

/// HTTP server for the webmail API
pub struct HttpServer {
    state: Arc<AppState>,
    options: HttpOptions,
    addr: SocketAddr,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: Arc<AppState>, options: HttpOptions) -> Self {
        Self { state, options, addr }
    }

    /// Start the server and serve requests until the task is cancelled
    pub async fn start(&self) -> Result<()> {
        let app = build_router(self.state.clone(), &self.options)?;
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("[HTTP] Webmail server listening on http://{}", self.addr);

        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Get the address the server is bound to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
