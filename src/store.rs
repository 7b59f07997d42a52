use crate::types::{Address, Attachment, Contact, DeliveryStatus, Mail, Mailbox, MailboxDetail};
use axum::body::Bytes;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Server-side session data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Name of the logged in account
    pub account: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            account: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.account.is_none()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Mailbox id for the conversation of `account` with `address`
pub fn mailbox_id(account: &str, address: &Address) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account.as_bytes());
    hasher.update([0u8]);
    hasher.update(address.key().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// In-memory mail store
#[derive(Debug, Clone)]
pub struct MailStore {
    mails: Arc<RwLock<HashMap<String, Mail>>>,
    mailboxes: Arc<RwLock<HashMap<String, Mailbox>>>,
    // Index of mailbox ids by account
    mailboxes_by_account: Arc<RwLock<HashMap<String, Vec<String>>>>,
    // Account -> lowercased address -> contact
    contacts: Arc<RwLock<HashMap<String, BTreeMap<String, Contact>>>>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    session_ttl: Duration,
}

impl MailStore {
    pub fn new() -> Self {
        Self::with_session_ttl(Duration::hours(24 * 7))
    }

    pub fn with_session_ttl(session_ttl: Duration) -> Self {
        Self {
            mails: Arc::new(RwLock::new(HashMap::new())),
            mailboxes: Arc::new(RwLock::new(HashMap::new())),
            mailboxes_by_account: Arc::new(RwLock::new(HashMap::new())),
            contacts: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            session_ttl,
        }
    }

    fn is_expired(&self, session: &Session) -> bool {
        Utc::now() - session.created_at > self.session_ttl
    }

    /// Session stored under `key`. Unknown and expired keys give an empty session.
    pub async fn get_user_session(&self, key: &str) -> Session {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(key) {
                Some(session) if !self.is_expired(session) => return session.clone(),
                Some(_) => {}
                None => return Session::new(),
            }
        }

        // Expired: check again under the write lock, the key may have been saved meanwhile
        let mut sessions = self.sessions.write().await;
        match sessions.get(key) {
            Some(session) if !self.is_expired(session) => session.clone(),
            Some(_) => {
                debug!("[STORE] Session expired, dropping it");
                sessions.remove(key);
                Session::new()
            }
            None => Session::new(),
        }
    }

    /// Save a session and drop every expired one
    pub async fn save_user_session(&self, key: &str, session: Session) {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !self.is_expired(s));
        if sessions.len() < before {
            debug!("[STORE] Dropped {} expired session(s)", before - sessions.len());
        }
        sessions.insert(key.to_string(), session);
    }

    pub async fn delete_user_session(&self, key: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(key);
    }

    /// Store a mail and file it into the mailboxes of its correspondents
    pub async fn store_mail(&self, mut mail: Mail) -> Mail {
        let correspondents = mail.correspondents();
        self.record_contacts(&mail.account, &correspondents).await;

        let mut mails = self.mails.write().await;
        let mut mailboxes = self.mailboxes.write().await;
        let mut by_account = self.mailboxes_by_account.write().await;

        file_into_mailboxes(&mut mail, &correspondents, &mut mailboxes, &mut by_account);
        mails.insert(mail.id.clone(), mail.clone());
        for id in &mail.mailbox_ids {
            if let Some(mailbox) = mailboxes.get_mut(id) {
                refresh_counters(mailbox, &mails);
            }
        }

        info!(
            "[STORE] Stored mail {} for '{}' in {} mailbox(es)",
            mail.id,
            mail.account,
            mail.mailbox_ids.len()
        );
        mail
    }

    /// File a stored mail into the mailboxes of `addrs` as well, whatever its
    /// direction. Used when a mail is sent again to new recipients.
    pub async fn file_mail(&self, mail_id: &str, addrs: &[Address]) -> Option<Mail> {
        let account = self.mails.read().await.get(mail_id)?.account.clone();
        self.record_contacts(&account, addrs).await;

        let mut mails = self.mails.write().await;
        let mut mailboxes = self.mailboxes.write().await;
        let mut by_account = self.mailboxes_by_account.write().await;

        let mail = mails.get_mut(mail_id)?;
        file_into_mailboxes(mail, addrs, &mut mailboxes, &mut by_account);
        let mail = mail.clone();
        for id in &mail.mailbox_ids {
            if let Some(mailbox) = mailboxes.get_mut(id) {
                refresh_counters(mailbox, &mails);
            }
        }
        debug!("[STORE] Mail {} now in {} mailbox(es)", mail.id, mail.mailbox_ids.len());
        Some(mail)
    }

    /// Clear the unread flag in place
    pub async fn mark_read(&self, mail_id: &str) -> Option<Mail> {
        let mut mails = self.mails.write().await;
        let mail = mails.get_mut(mail_id)?;
        mail.unread = false;
        let mail = mail.clone();

        let mut mailboxes = self.mailboxes.write().await;
        for id in &mail.mailbox_ids {
            if let Some(mailbox) = mailboxes.get_mut(id) {
                refresh_counters(mailbox, &mails);
            }
        }
        Some(mail)
    }

    /// Set the delivery status of `recipients` in place
    pub async fn set_status(&self, mail_id: &str, recipients: &[Address], status: DeliveryStatus) -> Option<Mail> {
        let mut mails = self.mails.write().await;
        let mail = mails.get_mut(mail_id)?;
        for recipient in recipients {
            mail.status.insert(recipient.key(), status.clone());
        }
        Some(mail.clone())
    }

    async fn record_contacts(&self, account: &str, addrs: &[Address]) {
        let mut contacts = self.contacts.write().await;
        let account_contacts = contacts.entry(account.to_string()).or_default();
        for addr in addrs {
            record_contact(account_contacts, addr);
        }
    }

    pub async fn get_mail(&self, mail_id: &str) -> Option<Mail> {
        let mails = self.mails.read().await;
        mails.get(mail_id).cloned()
    }

    /// Attachment metadata and content
    pub async fn get_mail_attachment(&self, mail_id: &str, index: usize) -> Option<(Attachment, Bytes)> {
        let mails = self.mails.read().await;
        let attachment = mails.get(mail_id)?.attachments.iter().find(|a| a.index == index)?;
        Some((attachment.clone(), attachment.content.clone()))
    }

    /// Mailboxes of an account, most recent activity first
    pub async fn get_mailboxes(&self, account: &str) -> Vec<Mailbox> {
        let mailboxes = self.mailboxes.read().await;
        let by_account = self.mailboxes_by_account.read().await;

        let mut result: Vec<Mailbox> = by_account
            .get(account)
            .map(|ids| ids.iter().filter_map(|id| mailboxes.get(id).cloned()).collect())
            .unwrap_or_default();
        result.sort_by(|a, b| b.last_message.cmp(&a.last_message));
        result
    }

    /// Mailbox with its message summaries, newest first
    pub async fn get_mailbox(&self, mailbox_id: &str) -> Option<MailboxDetail> {
        // Same lock order as store_mail: mails, then mailboxes
        let mails = self.mails.read().await;
        let mailboxes = self.mailboxes.read().await;

        let mailbox = mailboxes.get(mailbox_id)?.clone();
        let mut messages: Vec<_> = mailbox
            .messages
            .iter()
            .filter_map(|id| mails.get(id))
            .map(Mail::summary)
            .collect();
        messages.sort_by(|a, b| b.date.cmp(&a.date));

        Some(MailboxDetail { mailbox, messages })
    }

    /// Case-insensitive search over the name and address of an account's contacts
    pub async fn contacts_search(&self, account: &str, text: &str, limit: usize) -> Vec<Contact> {
        let needle = text.trim().to_lowercase();
        let contacts = self.contacts.read().await;

        let mut result: Vec<Contact> = contacts
            .get(account)
            .map(|c| {
                c.values()
                    .filter(|contact| {
                        contact.address.to_lowercase().contains(&needle)
                            || contact.name.to_lowercase().contains(&needle)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        result.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.address.cmp(&b.address))
        });
        result.truncate(limit);
        result
    }

    /// Add a contact without a mail, used when preloading address books
    pub async fn add_contact(&self, account: &str, contact: Contact) {
        let mut contacts = self.contacts.write().await;
        record_contact(
            contacts.entry(account.to_string()).or_default(),
            &Address::new(contact.name, contact.address),
        );
    }

    /// Get count of mails
    pub async fn count(&self) -> usize {
        let mails = self.mails.read().await;
        mails.len()
    }
}

impl Default for MailStore {
    fn default() -> Self {
        Self::new()
    }
}

fn record_contact(contacts: &mut BTreeMap<String, Contact>, addr: &Address) {
    let entry = contacts.entry(addr.key()).or_insert_with(|| Contact {
        name: String::new(),
        address: addr.address.clone(),
    });
    // Keep a known name when the new mail carries none
    if !addr.name.is_empty() {
        entry.name = addr.name.clone();
    }
}

/// Add `mail` to the mailbox of every address, creating missing mailboxes
fn file_into_mailboxes(
    mail: &mut Mail,
    addrs: &[Address],
    mailboxes: &mut HashMap<String, Mailbox>,
    by_account: &mut HashMap<String, Vec<String>>,
) {
    for addr in addrs {
        let id = mailbox_id(&mail.account, addr);
        let mailbox = mailboxes.entry(id.clone()).or_insert_with(|| {
            by_account
                .entry(mail.account.clone())
                .or_default()
                .push(id.clone());
            Mailbox {
                id: id.clone(),
                account: mail.account.clone(),
                name: if addr.name.is_empty() {
                    addr.address.clone()
                } else {
                    addr.name.clone()
                },
                address: addr.key(),
                last_message: mail.date,
                total: 0,
                unreads: 0,
                messages: vec![],
            }
        });
        if !mailbox.messages.contains(&mail.id) {
            mailbox.messages.push(mail.id.clone());
        }
        if !mail.mailbox_ids.contains(&id) {
            mail.mailbox_ids.push(id);
        }
    }
}

fn refresh_counters(mailbox: &mut Mailbox, mails: &HashMap<String, Mail>) {
    let messages: Vec<&Mail> = mailbox.messages.iter().filter_map(|id| mails.get(id)).collect();
    mailbox.total = messages.len();
    mailbox.unreads = messages.iter().filter(|m| m.unread).count();
    if let Some(last) = messages.iter().map(|m| m.date).max() {
        mailbox.last_message = last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryState;
    use chrono::TimeZone;

    fn mail(id: &str, account: &str, incoming: bool, from: Address, tos: Vec<Address>, day: u32) -> Mail {
        Mail {
            id: id.to_string(),
            account: account.to_string(),
            mailbox_ids: vec![],
            incoming,
            subject: format!("Subject {}", id),
            from,
            tos,
            ccs: vec![],
            date: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
            unread: incoming,
            body: "body".to_string(),
            body_html: None,
            attachments: vec![Attachment {
                index: 0,
                content_type: "text/plain".to_string(),
                filename: Some("a.txt".to_string()),
                url: None,
                content: Bytes::from_static(b"hello"),
            }],
            status: BTreeMap::new(),
            raw: vec![],
        }
    }

    fn alice() -> Address {
        Address::new("Alice", "alice@example.com")
    }

    fn me() -> Address {
        Address::new("Test", "test@example.com")
    }

    #[tokio::test]
    async fn test_store_files_by_correspondent() {
        let store = MailStore::new();
        store.store_mail(mail("m1", "test", true, alice(), vec![me()], 1)).await;
        store
            .store_mail(mail("m2", "test", false, me(), vec![Address::new("", "ALICE@example.com")], 2))
            .await;
        store
            .store_mail(mail("m3", "test", true, Address::new("Bob", "bob@example.com"), vec![me()], 3))
            .await;

        let mailboxes = store.get_mailboxes("test").await;
        assert_eq!(mailboxes.len(), 2);
        // Bob wrote last
        assert_eq!(mailboxes[0].address, "bob@example.com");
        assert_eq!(mailboxes[1].name, "Alice");
        assert_eq!(mailboxes[1].total, 2);
        assert_eq!(mailboxes[1].unreads, 1);

        let detail = store.get_mailbox(&mailboxes[1].id).await.unwrap();
        let ids: Vec<&str> = detail.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
        assert_eq!(detail.mailbox.account, "test");

        assert!(store.get_mailboxes("other").await.is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_refreshes_unreads() {
        let store = MailStore::new();
        let stored = store.store_mail(mail("m1", "test", true, alice(), vec![me()], 1)).await;
        let mailbox_id = stored.mailbox_ids[0].clone();
        assert_eq!(store.get_mailbox(&mailbox_id).await.unwrap().mailbox.unreads, 1);

        let read = store.mark_read("m1").await.unwrap();
        assert!(!read.unread);
        assert_eq!(store.get_mailbox(&mailbox_id).await.unwrap().mailbox.unreads, 0);
        assert!(!store.get_mail("m1").await.unwrap().unread);

        assert!(store.mark_read("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_in_place_updates_do_not_overwrite_each_other() {
        let store = MailStore::new();
        let stale = store.store_mail(mail("m1", "test", true, alice(), vec![me()], 1)).await;
        let bob = Address::new("Bob", "bob@example.com");

        store
            .set_status("m1", &[bob.clone()], DeliveryStatus::new(DeliveryState::Delivered, None))
            .await
            .unwrap();
        store.file_mail("m1", &[bob]).await.unwrap();
        // Marking read after the copy above was taken keeps the new recipient
        store.mark_read("m1").await.unwrap();

        let current = store.get_mail("m1").await.unwrap();
        assert!(!current.unread);
        assert_eq!(current.status["bob@example.com"].status, DeliveryState::Delivered);
        assert_eq!(current.mailbox_ids.len(), 2);
        assert_eq!(stale.mailbox_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_file_mail_under_new_recipient() {
        let store = MailStore::new();
        store.store_mail(mail("m1", "test", true, alice(), vec![me()], 1)).await;

        let filed = store
            .file_mail("m1", &[Address::new("", "Bob@Example.com")])
            .await
            .unwrap();
        assert_eq!(filed.mailbox_ids.len(), 2);

        let mailboxes = store.get_mailboxes("test").await;
        let bob = mailboxes.iter().find(|m| m.address == "bob@example.com").unwrap();
        assert_eq!(bob.total, 1);
        assert_eq!(store.get_mailbox(&bob.id).await.unwrap().messages[0].id, "m1");
        assert_eq!(store.contacts_search("test", "bob", 10).await.len(), 1);

        // Filing twice does not duplicate
        let again = store.file_mail("m1", &[Address::new("", "bob@example.com")]).await.unwrap();
        assert_eq!(again.mailbox_ids.len(), 2);
        assert!(store.file_mail("nope", &[alice()]).await.is_none());
    }

    #[tokio::test]
    async fn test_get_mail_attachment() {
        let store = MailStore::new();
        store.store_mail(mail("m1", "test", true, alice(), vec![me()], 1)).await;

        let (info, content) = store.get_mail_attachment("m1", 0).await.unwrap();
        assert_eq!(info.filename.as_deref(), Some("a.txt"));
        assert_eq!(&content[..], b"hello");
        assert!(store.get_mail_attachment("m1", 1).await.is_none());
        assert!(store.get_mail_attachment("m9", 0).await.is_none());
    }

    #[tokio::test]
    async fn test_contacts_search() {
        let store = MailStore::new();
        store.store_mail(mail("m1", "test", true, alice(), vec![me()], 1)).await;
        store
            .store_mail(mail("m2", "test", false, me(), vec![Address::new("", "bob@example.org")], 2))
            .await;
        store
            .add_contact("other", Contact { name: "Alicia".to_string(), address: "alicia@example.com".to_string() })
            .await;

        let found = store.contacts_search("test", "ALI", 10).await;
        assert_eq!(found, vec![Contact { name: "Alice".to_string(), address: "alice@example.com".to_string() }]);

        let found = store.contacts_search("test", "example", 10).await;
        assert_eq!(found.len(), 2);
        assert_eq!(store.contacts_search("test", "example", 1).await.len(), 1);
        assert!(store.contacts_search("test", "nobody", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_sessions() {
        let store = MailStore::new();
        assert!(store.get_user_session("missing").await.is_empty());

        let mut session = Session::new();
        session.account = Some("test".to_string());
        store.save_user_session("k1", session.clone()).await;
        assert_eq!(store.get_user_session("k1").await, session);

        store.delete_user_session("k1").await;
        assert!(store.get_user_session("k1").await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_session_is_empty() {
        let store = MailStore::with_session_ttl(Duration::hours(1));
        let session = Session {
            account: Some("test".to_string()),
            created_at: Utc::now() - Duration::hours(2),
        };
        store.save_user_session("old", session).await;
        assert!(store.get_user_session("old").await.is_empty());
        assert!(store.sessions.read().await.get("old").is_none());
    }

    #[tokio::test]
    async fn test_save_drops_expired_sessions() {
        let store = MailStore::with_session_ttl(Duration::hours(1));
        let stale = Session {
            account: Some("test".to_string()),
            created_at: Utc::now() - Duration::hours(2),
        };
        store.sessions.write().await.insert("never-used-again".to_string(), stale);

        store.save_user_session("fresh", Session::new()).await;

        let sessions = store.sessions.read().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions.contains_key("fresh"));
    }

    #[test]
    fn test_mailbox_id_is_stable() {
        let a = mailbox_id("test", &Address::new("", "Alice@Example.com"));
        let b = mailbox_id("test", &alice());
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, mailbox_id("other", &alice()));
    }
}
