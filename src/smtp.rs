use crate::account::Account;
use crate::mailutils;
use crate::store::MailStore;
use crate::types::{Address, DeliveryState, DeliveryStatus, Mail};
use anyhow::{anyhow, Result};
use clap::ValueEnum;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::stub::AsyncStubTransport;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{info, warn};
use std::sync::Arc;

/// How to secure the connection to the SMTP relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SmtpSecurity {
    /// Plain connection, for local relays
    None,
    Starttls,
    /// Implicit TLS (usually port 465)
    Tls,
}

/// SMTP relay settings
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub credentials: Option<(String, String)>,
}

/// Where outgoing messages go
pub enum MailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    /// Records messages instead of delivering them (dry run and tests)
    Stub(AsyncStubTransport),
}

impl MailTransport {
    pub fn relay(settings: &RelaySettings) -> Result<Self> {
        let mut builder = match settings.security {
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host),
            SmtpSecurity::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?,
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?,
        }
        .port(settings.port);

        if let Some((user, password)) = &settings.credentials {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(MailTransport::Smtp(builder.build()))
    }

    pub fn stub() -> Self {
        MailTransport::Stub(AsyncStubTransport::new_ok())
    }

    /// Stub transport rejecting every message
    pub fn failing_stub() -> Self {
        MailTransport::Stub(AsyncStubTransport::new_error())
    }

    async fn send_raw(&self, envelope: &Envelope, raw: &[u8]) -> Result<(), String> {
        match self {
            MailTransport::Smtp(transport) => transport
                .send_raw(envelope, raw)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            MailTransport::Stub(transport) => transport
                .send_raw(envelope, raw)
                .await
                .map_err(|e| e.to_string()),
        }
    }

    /// Messages recorded by a stub transport
    pub async fn sent_messages(&self) -> Vec<(Envelope, String)> {
        match self {
            MailTransport::Smtp(_) => vec![],
            MailTransport::Stub(transport) => transport.messages().await,
        }
    }
}

/// Hands composed messages to the transport and keeps track of their delivery
pub struct MailSender {
    store: Arc<MailStore>,
    transport: MailTransport,
}

impl MailSender {
    pub fn new(store: Arc<MailStore>, transport: MailTransport) -> Self {
        Self { store, transport }
    }

    pub fn transport(&self) -> &MailTransport {
        &self.transport
    }

    /// Store `message` as an outgoing mail of `account` and send it to every
    /// recipient. Delivery failures are recorded on the returned mail.
    pub async fn send_mail(
        &self,
        account: &Account,
        message: Message,
        from: &Address,
        recipients: &[Address],
    ) -> Result<Mail> {
        if recipients.is_empty() {
            return Err(anyhow!("No recipient"));
        }
        // Nothing is stored for addresses the transport would refuse
        let envelope = build_envelope(from, recipients)?;

        let raw = message.formatted();
        let mut mail = mailutils::parse_raw(&account.name, &raw, false)?;
        mail.unread = false;
        for recipient in recipients {
            mail.status
                .insert(recipient.key(), DeliveryStatus::new(DeliveryState::Sending, None));
        }
        let mail = self.store.store_mail(mail).await;

        self.deliver(&mail.id, &raw, &envelope, recipients).await
    }

    /// Send a stored mail again to new recipients and file it in their mailboxes
    pub async fn resend_mail(&self, account: &Account, mail: &Mail, tos: &[Address]) -> Result<Mail> {
        if mail.raw.is_empty() {
            return Err(anyhow!("Mail {} has no source to resend", mail.id));
        }
        if tos.is_empty() {
            return Err(anyhow!("No recipient"));
        }

        let from = mailutils::parse_email(&account.address)?;
        let envelope = build_envelope(&from, tos)?;

        self.store
            .set_status(&mail.id, tos, DeliveryStatus::new(DeliveryState::Sending, None))
            .await
            .ok_or_else(|| anyhow!("Mail {} is not stored", mail.id))?;
        self.store
            .file_mail(&mail.id, tos)
            .await
            .ok_or_else(|| anyhow!("Mail {} is not stored", mail.id))?;

        self.deliver(&mail.id, &mail.raw, &envelope, tos).await
    }

    async fn deliver(&self, mail_id: &str, raw: &[u8], envelope: &Envelope, recipients: &[Address]) -> Result<Mail> {
        let status = match self.transport.send_raw(envelope, raw).await {
            Ok(()) => {
                info!("[SMTP] Mail {} delivered to {} recipient(s)", mail_id, recipients.len());
                DeliveryStatus::new(DeliveryState::Delivered, None)
            }
            Err(reason) => {
                warn!("[SMTP] Mail {} delivery failed: {}", mail_id, reason);
                DeliveryStatus::new(DeliveryState::Error, Some(reason))
            }
        };

        self.store
            .set_status(mail_id, recipients, status)
            .await
            .ok_or_else(|| anyhow!("Mail disappeared from the store during delivery"))
    }
}

fn build_envelope(from: &Address, recipients: &[Address]) -> Result<Envelope> {
    let to_addrs = recipients
        .iter()
        .map(|r| r.to_lettre())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Envelope::new(Some(from.to_lettre()?), to_addrs)?)
}
