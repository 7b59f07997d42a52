use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Serialize timestamps the way the web client expects them
/// (`2024-03-01T09:30:00+00:00`).
pub mod iso_date {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Mail address with optional display name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct Address {
    #[serde(default)]
    pub name: String,
    pub address: String,
}

impl Address {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Lowercased address, used as the key for mailboxes and contacts
    pub fn key(&self) -> String {
        self.address.to_lowercase()
    }

    pub fn to_lettre(&self) -> Result<lettre::Address, lettre::address::AddressError> {
        self.address.parse()
    }

    pub fn to_mailbox(&self) -> Result<lettre::message::Mailbox, lettre::address::AddressError> {
        let name = if self.name.is_empty() {
            None
        } else {
            Some(self.name.clone())
        };
        Ok(lettre::message::Mailbox::new(name, self.to_lettre()?))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} <{}>", self.name, self.address)
        }
    }
}

/// Login credentials posted to `/login`
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

/// Mail attachment. The content never leaves the server through the JSON views,
/// it is only served by the attachment download route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Attachment {
    pub index: usize,
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip)]
    pub content: Bytes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sending,
    Delivered,
    Error,
}

/// Delivery status of an outgoing mail for one recipient
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub status: DeliveryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(with = "iso_date")]
    pub updated_at: DateTime<Utc>,
}

impl DeliveryStatus {
    pub fn new(status: DeliveryState, reason: Option<String>) -> Self {
        Self {
            status,
            reason,
            updated_at: Utc::now(),
        }
    }
}

/// A stored mail, incoming or outgoing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub id: String,
    pub account: String,
    pub mailbox_ids: Vec<String>,
    pub incoming: bool,
    pub subject: String,
    pub from: Address,
    pub tos: Vec<Address>,
    pub ccs: Vec<Address>,
    #[serde(with = "iso_date")]
    pub date: DateTime<Utc>,
    pub unread: bool,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Recipient address -> delivery status (outgoing mails only)
    #[serde(default)]
    pub status: BTreeMap<String, DeliveryStatus>,
    /// RFC 5322 source, kept for resend
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl Mail {
    /// Addresses of the other party: the sender of an incoming mail, every
    /// recipient of an outgoing one.
    pub fn correspondents(&self) -> Vec<Address> {
        if self.incoming {
            return vec![self.from.clone()];
        }

        let mut result: Vec<Address> = Vec::new();
        for addr in self.tos.iter().chain(self.ccs.iter()) {
            if !result.iter().any(|a| a.key() == addr.key()) {
                result.push(addr.clone());
            }
        }
        // Envelope-only recipients (bcc) are known from the delivery status
        for key in self.status.keys() {
            if !result.iter().any(|a| &a.key() == key) {
                result.push(Address::new("", key.clone()));
            }
        }
        result
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id.clone(),
            subject: self.subject.clone(),
            from: self.from.clone(),
            date: self.date,
            unread: self.unread,
            incoming: self.incoming,
            attachments: self.attachments.len(),
        }
    }
}

/// Entry of a mailbox listing
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: String,
    pub subject: String,
    pub from: Address,
    #[serde(with = "iso_date")]
    pub date: DateTime<Utc>,
    pub unread: bool,
    pub incoming: bool,
    pub attachments: usize,
}

/// A conversation between an account and one correspondent
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Mailbox {
    pub id: String,
    pub account: String,
    pub name: String,
    pub address: String,
    #[serde(with = "iso_date")]
    pub last_message: DateTime<Utc>,
    pub total: usize,
    pub unreads: usize,
    #[serde(skip)]
    pub messages: Vec<String>, // Mail IDs
}

/// Mailbox with its messages, newest first
#[derive(Debug, Clone, Serialize)]
pub struct MailboxDetail {
    #[serde(flatten)]
    pub mailbox: Mailbox,
    pub messages: Vec<MessageSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recipient {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: RecipientType,
}

/// Attachment uploaded with `/api/sendmail/`
#[derive(Debug, Clone, Deserialize)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub b64: String,
    #[serde(rename = "type", default)]
    pub content_type: Option<String>,
}

/// Body of `/api/sendmail/`
#[derive(Debug, Clone, Deserialize)]
pub struct SendMailRequest {
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
}

/// Body of `/api/mail/{id}/resend`
#[derive(Debug, Clone, Deserialize)]
pub struct ResendRequest {
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn outgoing_mail() -> Mail {
        Mail {
            id: "m1".to_string(),
            account: "alice".to_string(),
            mailbox_ids: vec![],
            incoming: false,
            subject: "Hello".to_string(),
            from: Address::new("Alice", "alice@example.com"),
            tos: vec![Address::new("Bob", "Bob@Example.com")],
            ccs: vec![Address::new("", "bob@example.com"), Address::new("", "carol@example.com")],
            date: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
            unread: false,
            body: "Hi".to_string(),
            body_html: None,
            attachments: vec![],
            status: BTreeMap::new(),
            raw: vec![],
        }
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new("Bob", "bob@example.com").to_string(), "Bob <bob@example.com>");
        assert_eq!(Address::new("", "bob@example.com").to_string(), "bob@example.com");
    }

    #[test]
    fn test_correspondents_deduplicates_recipients() {
        let mut mail = outgoing_mail();
        mail.status.insert(
            "dave@example.com".to_string(),
            DeliveryStatus::new(DeliveryState::Sending, None),
        );

        let keys: Vec<String> = mail.correspondents().iter().map(|a| a.key()).collect();
        assert_eq!(keys, vec!["bob@example.com", "carol@example.com", "dave@example.com"]);

        mail.incoming = true;
        assert_eq!(mail.correspondents(), vec![mail.from.clone()]);
    }

    #[test]
    fn test_mail_date_is_iso() {
        let value = serde_json::to_value(outgoing_mail()).unwrap();
        assert_eq!(value["date"], "2024-03-01T09:30:00+00:00");
        assert!(value.get("raw").is_none());
    }

    #[test]
    fn test_attachment_content_is_not_serialized() {
        let att = Attachment {
            index: 1,
            content_type: "text/plain".to_string(),
            filename: None,
            url: None,
            content: Bytes::from_static(b"secret"),
        };
        let value = serde_json::to_value(&att).unwrap();
        assert_eq!(value, serde_json::json!({"index": 1, "type": "text/plain"}));
    }
}
