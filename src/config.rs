use crate::account::{hash_password, Account};
use crate::server::HttpOptions;
use crate::smtp::{RelaySettings, SmtpSecurity};
use crate::types::{Contact, Mail};
use anyhow::{anyhow, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Configuration for the webmail server
#[derive(Debug, Clone, Parser)]
#[command(name = "webmail-server")]
#[command(about = "Webmail HTTP backend")]
pub struct Config {
    /// Address to bind the HTTP server to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// HTTP port to listen on (default: 8000)
    #[arg(short, long, default_value = "8000")]
    pub port: u16,

    /// Path to JSON file with accounts, mails and contacts to preload
    #[arg(long)]
    pub preload: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path (default: webmail.log)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Directory of the web client to serve
    #[arg(long)]
    pub static_dir: Option<PathBuf>,

    /// Origin allowed to call the API from another site (CORS)
    #[arg(long)]
    pub allow_origin: Option<String>,

    /// Lifetime of a login session, in hours
    #[arg(long, default_value = "168")]
    pub session_ttl_hours: i64,

    /// SMTP relay for outgoing mail. Without it mails are only recorded (dry run)
    #[arg(long)]
    pub smtp_host: Option<String>,

    #[arg(long, default_value = "587")]
    pub smtp_port: u16,

    #[arg(long, value_enum, default_value = "starttls")]
    pub smtp_security: SmtpSecurity,

    #[arg(long)]
    pub smtp_user: Option<String>,

    #[arg(long)]
    pub smtp_password: Option<String>,

    /// Generate fake mails for a `demo` account (password `demo`)
    #[arg(long)]
    pub generate_fake_mails: Option<usize>,

    /// Output file for the generated data (preload JSON format)
    #[arg(long)]
    pub output_preload: Option<PathBuf>,

    /// Seed for random number generator (for deterministic mail generation)
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            static_dir: self.static_dir.clone(),
            allow_origin: self.allow_origin.clone(),
        }
    }

    /// Relay settings, `None` when mails should not leave the server
    pub fn relay_settings(&self) -> Result<Option<RelaySettings>> {
        let host = match &self.smtp_host {
            Some(host) => host.clone(),
            None => return Ok(None),
        };
        let credentials = match (&self.smtp_user, &self.smtp_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            (None, None) => None,
            _ => return Err(anyhow!("--smtp-user and --smtp-password go together")),
        };
        Ok(Some(RelaySettings {
            host,
            port: self.smtp_port,
            security: self.smtp_security,
            credentials,
        }))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8000,
            preload: None,
            log_level: "info".to_string(),
            log_file: None,
            static_dir: None,
            allow_origin: None,
            session_ttl_hours: 168,
            smtp_host: None,
            smtp_port: 587,
            smtp_security: SmtpSecurity::Starttls,
            smtp_user: None,
            smtp_password: None,
            generate_fake_mails: None,
            output_preload: None,
            seed: 0,
        }
    }
}

/// Preload file content
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreloadConfig {
    #[serde(default)]
    pub accounts: Vec<PreloadAccount>,
    #[serde(default)]
    pub mails: Vec<PreloadMail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<PreloadContact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadAccount {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Clear text password, hashed on load. Handy for local setups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl TryFrom<PreloadAccount> for Account {
    type Error = anyhow::Error;

    fn try_from(account: PreloadAccount) -> Result<Self> {
        let password_hash = match (account.password_hash, account.password) {
            (Some(hash), _) => hash.to_lowercase(),
            (None, Some(password)) => hash_password(&password),
            (None, None) => return Err(anyhow!("Account '{}' has no password", account.name)),
        };
        Ok(Account {
            name: account.name,
            address: account.address,
            password_hash,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadMail {
    pub account: String,
    pub incoming: bool,
    /// Defaults to `incoming`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread: Option<bool>,
    /// RFC 5322 source
    pub raw: String,
}

impl PreloadMail {
    pub fn from_mail(mail: &Mail) -> Self {
        Self {
            account: mail.account.clone(),
            incoming: mail.incoming,
            unread: Some(mail.unread),
            raw: String::from_utf8_lossy(&mail.raw).into_owned(),
        }
    }

    pub fn to_mail(&self) -> Result<Mail> {
        let mut mail = crate::mailutils::parse_raw(&self.account, self.raw.as_bytes(), self.incoming)?;
        mail.unread = self.unread.unwrap_or(self.incoming);
        Ok(mail)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadContact {
    pub account: String,
    #[serde(flatten)]
    pub contact: Contact,
}

/// Load a preload file
pub fn load_preload(path: &Path) -> Result<PreloadConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: PreloadConfig = serde_json::from_str(&content)?;
    Ok(config)
}

/// Write a preload file
pub fn write_preload(preload: &PreloadConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(preload)?;
    std::fs::write(path, json)?;
    Ok(())
}
