use crate::types::{Address, Attachment, Mail, OutgoingAttachment};
use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use base64::Engine;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::{Attachment as AttachmentPart, MultiPart, SinglePart};
use lettre::Message;
use log::{debug, warn};
use mailparse::*;
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Parse `Name <user@host>`, `<user@host>` or `user@host`
pub fn parse_email(value: &str) -> Result<Address> {
    let list = addrparse(value.trim()).map_err(|e| anyhow!("Invalid address '{}': {}", value, e))?;
    let mut addresses = flatten_addresses(&list);
    if addresses.len() != 1 {
        return Err(anyhow!("Expected exactly one address in '{}'", value));
    }
    let address = addresses.remove(0);
    // Same rules as the transport, so a parsed address can always be sent to
    address
        .to_lettre()
        .map_err(|e| anyhow!("Invalid address '{}': {}", value, e))?;
    Ok(address)
}

fn flatten_addresses(list: &MailAddrList) -> Vec<Address> {
    let single = |info: &SingleInfo| Address::new(info.display_name.clone().unwrap_or_default(), info.addr.clone());
    list.iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![single(info)],
            MailAddr::Group(group) => group.addrs.iter().map(single).collect(),
        })
        .collect()
}

fn header_addresses(headers: &[MailHeader], name: &str) -> Vec<Address> {
    match headers.get_first_header(name) {
        Some(header) => match addrparse_header(header) {
            Ok(list) => flatten_addresses(&list),
            Err(e) => {
                warn!("[MAIL] Ignoring unparseable {} header: {}", name, e);
                vec![]
            }
        },
        None => vec![],
    }
}

/// Outgoing message before it is turned into RFC 5322
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub subject: String,
    pub content: String,
    pub from: Address,
    pub tos: Vec<Address>,
    pub ccs: Vec<Address>,
    /// Envelope-only recipients; lettre drops the Bcc header when formatting
    pub bccs: Vec<Address>,
    pub attachments: Vec<OutgoingAttachment>,
    /// Defaults to now
    pub date: Option<SystemTime>,
}

/// Build the message for a draft. Attachments are base64 decoded and their
/// content type is guessed from the file name when not given.
pub fn make_msg(draft: &MessageDraft) -> Result<Message> {
    let mut builder = Message::builder()
        .from(draft.from.to_mailbox()?)
        .subject(draft.subject.clone())
        .date(draft.date.unwrap_or_else(SystemTime::now));

    for to in &draft.tos {
        builder = builder.to(to.to_mailbox()?);
    }
    for cc in &draft.ccs {
        builder = builder.cc(cc.to_mailbox()?);
    }
    for bcc in &draft.bccs {
        builder = builder.bcc(bcc.to_mailbox()?);
    }

    let text = SinglePart::plain(draft.content.clone());
    let message = if draft.attachments.is_empty() {
        builder.singlepart(text)
    } else {
        let mut mixed = MultiPart::mixed().singlepart(text);
        for attachment in &draft.attachments {
            let content = base64::engine::general_purpose::STANDARD
                .decode(attachment.b64.trim())
                .with_context(|| format!("Invalid base64 content for attachment '{}'", attachment.filename))?;
            let content_type = match &attachment.content_type {
                Some(t) => t.clone(),
                None => mime_guess::from_path(&attachment.filename)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
            };
            let content_type = ContentType::parse(&content_type)
                .map_err(|e| anyhow!("Invalid content type '{}': {}", content_type, e))?;
            mixed = mixed.singlepart(AttachmentPart::new(attachment.filename.clone()).body(content, content_type));
        }
        builder.multipart(mixed)
    };

    message.map_err(|e| anyhow!("Failed to build message: {}", e))
}

/// Parse an RFC 5322 message into a mail of `account`
pub fn parse_raw(account: &str, raw: &[u8], incoming: bool) -> Result<Mail> {
    let parsed = parse_mail(raw).context("Failed to parse message")?;
    let headers = &parsed.headers;

    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let from = header_addresses(headers, "From").into_iter().next().unwrap_or_default();
    let tos = header_addresses(headers, "To");
    let ccs = header_addresses(headers, "Cc");
    let date = headers
        .get_first_value("Date")
        .and_then(|d| dateparse(&d).ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    let mut parts = Parts::default();
    parts.collect(&parsed)?;
    debug!(
        "[MAIL] Parsed '{}' ({} bytes, {} attachments)",
        subject,
        raw.len(),
        parts.attachments.len()
    );

    Ok(Mail {
        id: uuid::Uuid::new_v4().simple().to_string(),
        account: account.to_string(),
        mailbox_ids: vec![],
        incoming,
        subject,
        from,
        tos,
        ccs,
        date,
        unread: incoming,
        body: parts.body.unwrap_or_default(),
        body_html: parts.html,
        attachments: parts.attachments,
        status: BTreeMap::new(),
        raw: raw.to_vec(),
    })
}

#[derive(Default)]
struct Parts {
    body: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
}

impl Parts {
    fn collect(&mut self, part: &ParsedMail) -> Result<()> {
        if !part.subparts.is_empty() {
            for sub in &part.subparts {
                self.collect(sub)?;
            }
            return Ok(());
        }

        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned();
        let mimetype = part.ctype.mimetype.to_lowercase();

        if disposition.disposition != DispositionType::Attachment && filename.is_none() {
            if mimetype == "text/plain" && self.body.is_none() {
                self.body = Some(part.get_body()?);
                return Ok(());
            }
            if mimetype == "text/html" && self.html.is_none() {
                self.html = Some(part.get_body()?);
                return Ok(());
            }
        }

        self.attachments.push(Attachment {
            index: self.attachments.len(),
            content_type: mimetype,
            filename,
            url: None,
            content: Bytes::from(part.get_body_raw()?),
        });
        Ok(())
    }
}

/// Name used for attachments sent without one: `file_{index}{ext}`
pub fn attachment_filename(index: usize, content_type: &str) -> String {
    let ext = mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| ".bin".to_string());
    format!("file_{}{}", index, ext)
}

pub fn attachment_url(mail_id: &str, index: usize, filename: &str) -> String {
    format!("/api/mail/{}/attachment/{}/{}", mail_id, index, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> MessageDraft {
        MessageDraft {
            subject: "Test mail".to_string(),
            content: "Content\nMultiline".to_string(),
            from: Address::new("Test", "test@example.com"),
            tos: vec![Address::new("", "alt@yopmail.com")],
            ccs: vec![Address::new("Carol", "carol@example.com")],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_email() {
        let addr = parse_email("Bob Smith <bob@example.com>").unwrap();
        assert_eq!(addr, Address::new("Bob Smith", "bob@example.com"));

        let addr = parse_email("bob@example.com").unwrap();
        assert_eq!(addr, Address::new("", "bob@example.com"));

        assert!(parse_email("not an address").is_err());
        assert!(parse_email("a@example.com, b@example.com").is_err());
        assert!(parse_email("bob@example..com").is_err());
        assert!(parse_email("Bob <bob@>").is_err());
    }

    #[test]
    fn test_make_msg_and_parse_back() {
        let mut draft = draft();
        draft.attachments.push(OutgoingAttachment {
            filename: "testfile.txt".to_string(),
            b64: "VGVzdAo=".to_string(),
            content_type: None,
        });

        let message = make_msg(&draft).unwrap();
        let mail = parse_raw("test", &message.formatted(), false).unwrap();

        assert_eq!(mail.subject, "Test mail");
        assert_eq!(mail.from, Address::new("Test", "test@example.com"));
        assert_eq!(mail.tos, vec![Address::new("", "alt@yopmail.com")]);
        assert_eq!(mail.ccs, vec![Address::new("Carol", "carol@example.com")]);
        assert!(mail.body.contains("Multiline"));
        assert!(!mail.unread);

        assert_eq!(mail.attachments.len(), 1);
        let att = &mail.attachments[0];
        assert_eq!(att.filename.as_deref(), Some("testfile.txt"));
        assert_eq!(att.content_type, "text/plain");
        assert_eq!(&att.content[..], b"Test\n");
    }

    #[test]
    fn test_make_msg_rejects_bad_base64() {
        let mut draft = draft();
        draft.attachments.push(OutgoingAttachment {
            filename: "broken.bin".to_string(),
            b64: "***".to_string(),
            content_type: None,
        });
        assert!(make_msg(&draft).is_err());
    }

    #[test]
    fn test_bcc_not_in_headers() {
        let mut draft = draft();
        draft.bccs.push(Address::new("", "hidden@example.com"));
        let message = make_msg(&draft).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(!formatted.contains("hidden@example.com"));
        assert!(message
            .envelope()
            .to()
            .iter()
            .any(|a| a.to_string() == "hidden@example.com"));
    }

    #[test]
    fn test_parse_raw_incoming_with_html_and_unnamed_attachment() {
        let raw = concat!(
            "From: Alice <alice@example.com>\r\n",
            "To: test@example.com\r\n",
            "Subject: Report\r\n",
            "Date: Fri, 01 Mar 2024 09:30:00 +0000\r\n",
            "Content-Type: multipart/mixed; boundary=\"XX\"\r\n",
            "\r\n",
            "--XX\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain body\r\n",
            "--XX\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>html body</p>\r\n",
            "--XX\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0=\r\n",
            "--XX--\r\n",
        );

        let mail = parse_raw("test", raw.as_bytes(), true).unwrap();
        assert!(mail.incoming);
        assert!(mail.unread);
        assert_eq!(mail.date.to_rfc3339(), "2024-03-01T09:30:00+00:00");
        assert_eq!(mail.body.trim(), "plain body");
        assert_eq!(mail.body_html.as_deref().map(str::trim), Some("<p>html body</p>"));
        assert_eq!(mail.attachments.len(), 1);
        assert_eq!(mail.attachments[0].filename, None);
        assert_eq!(mail.attachments[0].content_type, "application/pdf");
        assert_eq!(&mail.attachments[0].content[..], b"%PDF-");
    }

    #[test]
    fn test_attachment_filename() {
        assert_eq!(attachment_filename(2, "application/pdf"), "file_2.pdf");
        assert_eq!(attachment_filename(0, "application/x-unknown-thing"), "file_0.bin");
    }

    #[test]
    fn test_attachment_url() {
        assert_eq!(
            attachment_url("abc", 1, "file_1.pdf"),
            "/api/mail/abc/attachment/1/file_1.pdf"
        );
    }
}
