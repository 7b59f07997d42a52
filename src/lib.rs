pub mod account;
pub mod config;
pub mod error;
pub mod mailutils;
pub mod routes;
pub mod server;
pub mod session;
pub mod smtp;
pub mod store;
pub mod test_utils;
pub mod types;

// Re-export commonly used types
pub use account::{Account, AccountManager};
pub use error::{ApiError, ApiResult};
pub use server::{build_router, AppState, HttpOptions, HttpServer};
pub use smtp::{MailSender, MailTransport};
pub use store::{MailStore, Session};
pub use types::{Address, Mail, Mailbox};
